use crate::events::ThresholdAlert;
use crate::model::TelemetrySample;

/// Static range accepted for one measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    pub field: &'static str,
    pub min: f64,
    pub max: f64,
}

const fn range(field: &'static str, min: f64, max: f64) -> Range {
    Range { field, min, max }
}

pub static RANGES: [Range; 10] = [
    range("temperature", -40.0, 60.0),
    range("humidity", 0.0, 100.0),
    range("pressure", 300.0, 1100.0),
    range("heatIndex", -40.0, 80.0),
    range("windDirection", 0.0, 360.0),
    range("windSpeed", 0.0, 75.0),
    range("precipitation", 0.0, 500.0),
    range("uvIndex", 0.0, 15.0),
    range("distance", 0.0, 10_000.0),
    range("lightIntensity", 0.0, 200_000.0),
];

pub fn range_for(field: &str) -> Option<&'static Range> {
    RANGES.iter().find(|r| r.field == field)
}

/// Returns one alert per measurement outside its range. Missing fields are
/// not checked; NaN is always out of range.
pub fn check(sample: &TelemetrySample) -> Vec<ThresholdAlert> {
    sample
        .fields()
        .into_iter()
        .filter_map(|(field, value)| {
            let value = value?;
            let range = range_for(field)?;
            if value >= range.min && value <= range.max {
                return None;
            }
            Some(ThresholdAlert {
                station_id: sample.station_id,
                field,
                value,
                min: range.min,
                max: range.max,
                recorded_at: sample.recorded_at,
            })
        })
        .collect()
}
