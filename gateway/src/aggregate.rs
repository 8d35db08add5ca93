use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

use crate::model::{StationId, TelemetrySample};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub count: usize,
    pub latest: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StationAggregate {
    pub station_id: StationId,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub sample_count: usize,
    pub fields: BTreeMap<&'static str, FieldStats>,
}

/// Recent samples of one station, kept for a fixed span of time.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    span: Duration,
    samples: VecDeque<TelemetrySample>,
}

impl RollingWindow {
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            samples: VecDeque::new(),
        }
    }

    pub fn push(&mut self, sample: TelemetrySample) {
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Drops samples recorded before `now - span`.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.span;
        // Stations may deliver out of order, so no early exit.
        self.samples.retain(|sample| sample.recorded_at >= cutoff);
    }

    pub fn aggregate(&mut self, station_id: StationId, now: DateTime<Utc>) -> StationAggregate {
        self.prune(now);

        // (stats, recorded_at of `latest`)
        let mut fields: BTreeMap<&'static str, (FieldStats, DateTime<Utc>)> = BTreeMap::new();
        let mut sum: BTreeMap<&'static str, f64> = BTreeMap::new();

        for sample in &self.samples {
            for (field, value) in sample.fields() {
                let Some(value) = value else { continue };
                *sum.entry(field).or_default() += value;

                let (stats, latest_at) = fields.entry(field).or_insert((
                    FieldStats {
                        min: value,
                        max: value,
                        avg: value,
                        count: 0,
                        latest: value,
                    },
                    sample.recorded_at,
                ));
                stats.min = stats.min.min(value);
                stats.max = stats.max.max(value);
                stats.count += 1;
                if sample.recorded_at >= *latest_at {
                    stats.latest = value;
                    *latest_at = sample.recorded_at;
                }
            }
        }

        let fields = fields
            .into_iter()
            .map(|(field, (mut stats, _))| {
                stats.avg = sum[field] / stats.count as f64;
                (field, stats)
            })
            .collect();

        StationAggregate {
            station_id,
            window_start: now - self.span,
            window_end: now,
            sample_count: self.samples.len(),
            fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(at: DateTime<Utc>, temperature: f64, humidity: Option<f64>) -> TelemetrySample {
        let mut sample = TelemetrySample::empty(1, at);
        sample.temperature = Some(temperature);
        sample.humidity = humidity;
        sample
    }

    #[test]
    fn test_stats_per_field() {
        let now = Utc::now();
        let mut window = RollingWindow::new(Duration::minutes(5));
        window.push(sample(now - Duration::seconds(30), 20.0, Some(50.0)));
        window.push(sample(now - Duration::seconds(20), 24.0, None));
        window.push(sample(now - Duration::seconds(10), 22.0, Some(70.0)));

        let aggregate = window.aggregate(1, now);

        let temperature = &aggregate.fields["temperature"];
        assert_eq!(temperature.min, 20.0);
        assert_eq!(temperature.max, 24.0);
        assert_eq!(temperature.avg, 22.0);
        assert_eq!(temperature.count, 3);
        assert_eq!(temperature.latest, 22.0);

        let humidity = &aggregate.fields["humidity"];
        assert_eq!(humidity.count, 2);
        assert_eq!(humidity.avg, 60.0);
        assert!(!aggregate.fields.contains_key("pressure"));
        assert_eq!(aggregate.sample_count, 3);
    }

    #[test]
    fn test_old_samples_leave_the_window() {
        let now = Utc::now();
        let mut window = RollingWindow::new(Duration::minutes(5));
        window.push(sample(now - Duration::minutes(6), 10.0, None));
        window.push(sample(now - Duration::minutes(1), 30.0, None));

        let aggregate = window.aggregate(1, now);

        assert_eq!(window.len(), 1);
        assert_eq!(aggregate.fields["temperature"].min, 30.0);
        assert_eq!(aggregate.fields["temperature"].count, 1);
    }

    #[test]
    fn test_latest_follows_recorded_time_not_arrival() {
        let now = Utc::now();
        let mut window = RollingWindow::new(Duration::minutes(5));
        window.push(sample(now - Duration::seconds(5), 18.0, None));
        window.push(sample(now - Duration::seconds(50), 25.0, None));

        let aggregate = window.aggregate(1, now);
        assert_eq!(aggregate.fields["temperature"].latest, 18.0);
    }

    #[test]
    fn test_empty_window() {
        let mut window = RollingWindow::new(Duration::minutes(5));
        let aggregate = window.aggregate(1, Utc::now());
        assert!(window.is_empty());
        assert_eq!(aggregate.sample_count, 0);
        assert!(aggregate.fields.is_empty());
    }
}
