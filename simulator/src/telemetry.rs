use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Payload published on `devices/{id}/data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherReading {
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub heat_index: f64,
    pub wind_direction: f64,
    pub wind_speed: f64,
    pub precipitation: f64,
    pub uv_index: f64,
    pub distance: f64,
    pub light_intensity: f64,
}

/// Slowly drifting weather for one simulated station.
#[derive(Debug, Clone)]
pub struct WeatherModel {
    temperature: f64,
    humidity: f64,
    pressure: f64,
    wind_direction: f64,
    wind_speed: f64,
    outlier_rate: f64,
}

impl WeatherModel {
    pub fn new(rng: &mut impl Rng, outlier_rate: f64) -> Self {
        Self {
            temperature: rng.gen_range(10.0..28.0),
            humidity: rng.gen_range(40.0..70.0),
            pressure: rng.gen_range(995.0..1025.0),
            wind_direction: rng.gen_range(0.0..360.0),
            wind_speed: rng.gen_range(0.0..8.0),
            outlier_rate: outlier_rate.clamp(0.0, 1.0),
        }
    }

    pub fn next(&mut self, rng: &mut impl Rng) -> WeatherReading {
        self.temperature = (self.temperature + rng.gen_range(-0.3..0.3)).clamp(-30.0, 45.0);
        self.humidity = (self.humidity + rng.gen_range(-1.0..1.0)).clamp(5.0, 100.0);
        self.pressure = (self.pressure + rng.gen_range(-0.5..0.5)).clamp(950.0, 1050.0);
        self.wind_direction = (self.wind_direction + rng.gen_range(-10.0..10.0)).rem_euclid(360.0);
        self.wind_speed = (self.wind_speed + rng.gen_range(-0.5..0.5)).clamp(0.0, 40.0);

        let temperature = if rng.gen_bool(self.outlier_rate) {
            rng.gen_range(61.0..90.0) // sensor glitch
        } else {
            self.temperature
        };
        let raining = rng.gen_bool(0.1);

        WeatherReading {
            timestamp: Utc::now(),
            temperature: round(temperature),
            humidity: round(self.humidity),
            pressure: round(self.pressure),
            heat_index: round(heat_index(self.temperature, self.humidity)),
            wind_direction: round(self.wind_direction),
            wind_speed: round(self.wind_speed),
            precipitation: if raining { round(rng.gen_range(0.1..12.0)) } else { 0.0 },
            uv_index: round(rng.gen_range(0.0..11.0)),
            distance: round(rng.gen_range(50.0..400.0)),
            light_intensity: round(rng.gen_range(0.0..100_000.0)),
        }
    }
}

/// Steadman approximation, good enough for simulated data.
fn heat_index(temperature: f64, humidity: f64) -> f64 {
    temperature + 0.33 * (humidity / 100.0 * 6.105 * (17.27 * temperature / (237.7 + temperature)).exp())
        - 4.0
}

fn round(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readings_stay_plausible_without_outliers() {
        let mut rng = rand::thread_rng();
        let mut model = WeatherModel::new(&mut rng, 0.0);
        for _ in 0..500 {
            let reading = model.next(&mut rng);
            assert!((-30.0..=45.0).contains(&reading.temperature));
            assert!((5.0..=100.0).contains(&reading.humidity));
            assert!((0.0..=360.0).contains(&reading.wind_direction));
        }
    }

    #[test]
    fn test_reading_serializes_camel_case() {
        let mut rng = rand::thread_rng();
        let reading = WeatherModel::new(&mut rng, 0.0).next(&mut rng);
        let value = serde_json::to_value(&reading).unwrap();
        assert!(value.get("heatIndex").is_some());
        assert!(value.get("lightIntensity").is_some());
    }
}
