use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::CommandOrchestrator;
use crate::telemetry::TelemetryIngestor;

/// How long finished commands stay queryable in memory.
const FINISHED_COMMAND_RETENTION_SECS: i64 = 3600;

/// Flushes buffered telemetry every `every` until cancelled, then once more
/// so nothing buffered is lost on shutdown.
pub async fn run_flusher(
    ingestor: Arc<TelemetryIngestor>,
    every: Duration,
    cancel: CancellationToken,
) {
    info!("Starting telemetry flusher every {:?}", every);

    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let report = ingestor.flush().await;
                if report.failed > 0 {
                    warn!(
                        "Flush persisted {} sample(s), {} failed",
                        report.persisted, report.failed
                    );
                } else if report.persisted > 0 {
                    debug!("Flush persisted {} sample(s)", report.persisted);
                }
            }
        }
    }

    info!("Flusher stopping, flushing remaining samples");
    let report = ingestor.flush().await;
    info!(
        "Final flush persisted {} sample(s), {} failed",
        report.persisted, report.failed
    );
}

/// Re-evaluates station liveness every `every` and drops commands that
/// finished long ago.
pub async fn run_liveness_sweep(
    ingestor: Arc<TelemetryIngestor>,
    orchestrator: Arc<CommandOrchestrator>,
    every: Duration,
    cancel: CancellationToken,
) {
    info!("Starting liveness sweep every {:?}", every);

    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let now = Utc::now();
                let changed = ingestor.sweep_at(now);
                if !changed.is_empty() {
                    debug!("Liveness sweep changed {} station(s)", changed.len());
                }
                orchestrator
                    .evict_finished(now - chrono::Duration::seconds(FINISHED_COMMAND_RETENTION_SECS));
            }
        }
    }

    info!("Liveness sweep stopped");
}
