use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::aggregate::{RollingWindow, StationAggregate};
use crate::errors::{Error, Result};
use crate::events::{CoreEvent, EventBus};
use crate::metrics::{
    BUFFERED_SAMPLES, DB_FAILURES_TOTAL, FLUSH_LATENCY_SECONDS, TELEMETRY_SAMPLES_TOTAL,
    THRESHOLD_ALERTS_TOTAL,
};
use crate::model::{
    LivenessStatus, OrganizationId, Payload, StationId, StationLiveness, TelemetrySample,
};
use crate::persistence::Persistence;
use crate::thresholds;

#[derive(Debug, Clone)]
pub struct IngestorConfig {
    pub offline_after: Duration,
    pub error_after: Duration,
    pub aggregate_window: Duration,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            offline_after: Duration::minutes(2),
            error_after: Duration::minutes(10),
            aggregate_window: Duration::minutes(5),
        }
    }
}

impl IngestorConfig {
    pub fn classify(&self, since_last_seen: Duration) -> LivenessStatus {
        if since_last_seen <= self.offline_after {
            LivenessStatus::Online
        } else if since_last_seen <= self.error_after {
            LivenessStatus::Offline
        } else {
            LivenessStatus::Error
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub persisted: usize,
    pub failed: usize,
}

struct StationState {
    organization_id: Option<OrganizationId>,
    buffer: Vec<TelemetrySample>,
    window: RollingWindow,
    liveness: Option<StationLiveness>,
}

impl StationState {
    fn new(config: &IngestorConfig) -> Self {
        Self {
            organization_id: None,
            buffer: Vec::new(),
            window: RollingWindow::new(config.aggregate_window),
            liveness: None,
        }
    }

    /// Moves the station to `online`, returning the status it left if that
    /// is a change.
    fn touch(&mut self, station_id: StationId, at: DateTime<Utc>) -> Option<Option<LivenessStatus>> {
        match &mut self.liveness {
            Some(liveness) => {
                liveness.last_seen = liveness.last_seen.max(at);
                let previous = liveness.status;
                liveness.status = LivenessStatus::Online;
                (previous != LivenessStatus::Online).then_some(Some(previous))
            }
            None => {
                self.liveness = Some(StationLiveness {
                    station_id,
                    status: LivenessStatus::Online,
                    last_seen: at,
                });
                Some(None)
            }
        }
    }
}

/// Buffers telemetry per station, derives liveness and rolling aggregates,
/// and announces all of it on the event bus.
pub struct TelemetryIngestor {
    persistence: Arc<dyn Persistence>,
    bus: EventBus,
    config: IngestorConfig,
    stations: Mutex<HashMap<StationId, StationState>>,
}

impl TelemetryIngestor {
    pub fn new(persistence: Arc<dyn Persistence>, bus: EventBus, config: IngestorConfig) -> Self {
        Self {
            persistence,
            bus,
            config,
            stations: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &IngestorConfig {
        &self.config
    }

    /// Records which organisation a station belongs to, for routing alerts.
    pub fn track_station(&self, station_id: StationId, organization_id: Option<OrganizationId>) {
        let mut stations = self.stations.lock();
        stations
            .entry(station_id)
            .or_insert_with(|| StationState::new(&self.config))
            .organization_id = organization_id;
    }

    /// Drops all state for a removed station. Unflushed samples are lost.
    pub fn forget_station(&self, station_id: StationId) -> usize {
        let dropped = self
            .stations
            .lock()
            .remove(&station_id)
            .map(|state| state.buffer.len())
            .unwrap_or(0);
        if dropped > 0 {
            BUFFERED_SAMPLES.sub(dropped as f64);
            warn!(
                "Dropping {} unflushed sample(s) of removed station {}",
                dropped, station_id
            );
        }
        dropped
    }

    pub fn ingest_payload(
        &self,
        station_id: StationId,
        payload: &Payload,
    ) -> Result<StationAggregate> {
        let sample = TelemetrySample::from_payload(station_id, payload, Utc::now())?;
        self.ingest(sample)
            .ok_or_else(|| Error::NotFound(format!("tracked station {}", station_id)))
    }

    /// Buffers the sample and pushes it, its aggregate, any threshold alerts
    /// and a possible status change to the bus. Samples of stations that are
    /// not tracked are dropped.
    pub fn ingest(&self, sample: TelemetrySample) -> Option<StationAggregate> {
        let station_id = sample.station_id;

        let (organization_id, aggregate, change, last_seen) = {
            let mut stations = self.stations.lock();
            let Some(state) = stations.get_mut(&station_id) else {
                debug!("Dropping sample of untracked station {}", station_id);
                return None;
            };

            state.buffer.push(sample.clone());
            state.window.push(sample.clone());
            let aggregate = state.window.aggregate(station_id, Utc::now());
            let change = state.touch(station_id, sample.recorded_at);
            let last_seen = state
                .liveness
                .as_ref()
                .map(|l| l.last_seen)
                .unwrap_or(sample.recorded_at);
            (state.organization_id, aggregate, change, last_seen)
        };

        let alerts = thresholds::check(&sample);
        TELEMETRY_SAMPLES_TOTAL.inc();
        BUFFERED_SAMPLES.inc();
        debug!("Buffered sample for station {}", station_id);

        self.bus.publish(CoreEvent::Telemetry {
            organization_id,
            sample,
        });

        for alert in alerts {
            THRESHOLD_ALERTS_TOTAL.inc();
            warn!(
                "Station {} {} = {} outside [{}, {}]",
                station_id, alert.field, alert.value, alert.min, alert.max
            );
            self.bus.publish(CoreEvent::ThresholdExceeded {
                organization_id,
                alert,
            });
        }

        self.bus.publish(CoreEvent::Aggregate {
            organization_id,
            aggregate: aggregate.clone(),
        });

        if let Some(previous) = change {
            self.announce_status(
                station_id,
                organization_id,
                previous,
                LivenessStatus::Online,
                last_seen,
            );
        }
        Some(aggregate)
    }

    /// Marks the station as seen, e.g. because its link just connected.
    pub fn mark_seen(&self, station_id: StationId, at: DateTime<Utc>) {
        let (organization_id, change, last_seen) = {
            let mut stations = self.stations.lock();
            let Some(state) = stations.get_mut(&station_id) else {
                debug!("Ignoring activity of untracked station {}", station_id);
                return;
            };
            let change = state.touch(station_id, at);
            let last_seen = state.liveness.as_ref().map(|l| l.last_seen).unwrap_or(at);
            (state.organization_id, change, last_seen)
        };

        if let Some(previous) = change {
            self.announce_status(
                station_id,
                organization_id,
                previous,
                LivenessStatus::Online,
                last_seen,
            );
        }
    }

    pub fn liveness(&self, station_id: StationId) -> Option<StationLiveness> {
        self.stations
            .lock()
            .get(&station_id)
            .and_then(|state| state.liveness.clone())
    }

    pub fn liveness_all(&self) -> Vec<StationLiveness> {
        let mut all: Vec<StationLiveness> = self
            .stations
            .lock()
            .values()
            .filter_map(|state| state.liveness.clone())
            .collect();
        all.sort_by_key(|l| l.station_id);
        all
    }

    pub fn aggregate(&self, station_id: StationId, now: DateTime<Utc>) -> Option<StationAggregate> {
        self.stations
            .lock()
            .get_mut(&station_id)
            .map(|state| state.window.aggregate(station_id, now))
    }

    pub fn buffered(&self, station_id: StationId) -> usize {
        self.stations
            .lock()
            .get(&station_id)
            .map(|state| state.buffer.len())
            .unwrap_or(0)
    }

    /// Persists every buffered sample, one at a time. A sample that fails to
    /// save is logged and dropped; it never holds back the others.
    pub async fn flush(&self) -> FlushReport {
        let drained: Vec<(StationId, Vec<TelemetrySample>)> = {
            let mut stations = self.stations.lock();
            stations
                .iter_mut()
                .filter(|(_, state)| !state.buffer.is_empty())
                .map(|(id, state)| (*id, std::mem::take(&mut state.buffer)))
                .collect()
        };

        let mut report = FlushReport::default();
        if drained.is_empty() {
            return report;
        }

        let start = Instant::now();
        for (station_id, samples) in drained {
            for sample in samples {
                match self.persistence.save_telemetry(&sample).await {
                    Ok(()) => report.persisted += 1,
                    Err(e) => {
                        DB_FAILURES_TOTAL.inc();
                        error!(
                            "Failed to persist sample of station {} recorded at {}: {}",
                            station_id, sample.recorded_at, e
                        );
                        report.failed += 1;
                    }
                }
            }
        }

        FLUSH_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
        BUFFERED_SAMPLES.sub((report.persisted + report.failed) as f64);
        debug!(
            "Flushed {} sample(s), {} failed",
            report.persisted, report.failed
        );
        report
    }

    /// Reclassifies every known station against `now`. Only real changes
    /// produce events, so repeated sweeps stay quiet.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Vec<StationLiveness> {
        let changes: Vec<(Option<OrganizationId>, LivenessStatus, StationLiveness)> = {
            let mut stations = self.stations.lock();
            stations
                .values_mut()
                .filter_map(|state| {
                    let organization_id = state.organization_id;
                    let liveness = state.liveness.as_mut()?;
                    let status = self.config.classify(now - liveness.last_seen);
                    if status == liveness.status {
                        return None;
                    }
                    let previous = liveness.status;
                    liveness.status = status;
                    Some((organization_id, previous, liveness.clone()))
                })
                .collect()
        };

        for (organization_id, previous, liveness) in &changes {
            self.announce_status(
                liveness.station_id,
                *organization_id,
                Some(*previous),
                liveness.status,
                liveness.last_seen,
            );
        }
        changes.into_iter().map(|(_, _, liveness)| liveness).collect()
    }

    fn announce_status(
        &self,
        station_id: StationId,
        organization_id: Option<OrganizationId>,
        previous: Option<LivenessStatus>,
        status: LivenessStatus,
        last_seen: DateTime<Utc>,
    ) {
        info!(
            "Station {} is now {} (was {})",
            station_id,
            status,
            previous.map(|p| p.to_string()).unwrap_or_else(|| "unknown".into())
        );
        self.bus.publish(CoreEvent::StatusChanged {
            station_id,
            organization_id,
            previous,
            status,
            last_seen,
        });

        if previous == Some(LivenessStatus::Online) && status != LivenessStatus::Online {
            warn!("Lost contact with station {} since {}", station_id, last_seen);
            self.bus.publish(CoreEvent::ConnectionLost {
                station_id,
                organization_id,
                status,
                last_seen,
            });
        }
    }
}
