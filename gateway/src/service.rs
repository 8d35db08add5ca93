//! Composition root: builds the registry, orchestrator, ingestor and fanout
//! once and wires them together.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batching::{run_flusher, run_liveness_sweep};
use crate::commands::CommandOrchestrator;
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::events::{EventBus, LinkEvent, StationEvent};
use crate::fanout::{RealtimeFanout, RealtimeTransport};
use crate::link::MessageCallback;
use crate::metrics::{CONNECTED_STATIONS, INVALID_MESSAGES_TOTAL};
use crate::model::{Payload, StationCredentials, StationId, StationRef};
use crate::persistence::{CredentialProvider, Persistence};
use crate::registry::{ConnectSummary, LinkRegistry};
use crate::session::SessionFactory;
use crate::telemetry::TelemetryIngestor;
use crate::topic::{self, Route};

/// A message handed from a link callback to the inbound router.
#[derive(Debug, Clone)]
struct Inbound {
    station_id: StationId,
    topic: String,
    payload: Payload,
}

pub struct StationCore {
    config: Config,
    bus: EventBus,
    registry: Arc<LinkRegistry>,
    orchestrator: Arc<CommandOrchestrator>,
    ingestor: Arc<TelemetryIngestor>,
    fanout: Arc<RealtimeFanout>,
    persistence: Arc<dyn Persistence>,
    credentials: Arc<dyn CredentialProvider>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StationCore {
    pub fn new(
        config: Config,
        persistence: Arc<dyn Persistence>,
        credentials: Arc<dyn CredentialProvider>,
        factory: Arc<dyn SessionFactory>,
        transport: Arc<dyn RealtimeTransport>,
    ) -> Self {
        let bus = EventBus::new(config.event_capacity);
        let registry = Arc::new(LinkRegistry::new(
            factory,
            config.link_config(),
            config.event_capacity,
        ));
        let orchestrator = Arc::new(CommandOrchestrator::new(
            Arc::clone(&persistence),
            bus.clone(),
            config.command_timeout,
        ));
        let ingestor = Arc::new(TelemetryIngestor::new(
            Arc::clone(&persistence),
            bus.clone(),
            config.ingestor_config(),
        ));
        let fanout = Arc::new(RealtimeFanout::new(transport));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Self {
            config,
            bus,
            registry,
            orchestrator,
            ingestor,
            fanout,
            persistence,
            credentials,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<LinkRegistry> {
        &self.registry
    }

    pub fn orchestrator(&self) -> &Arc<CommandOrchestrator> {
        &self.orchestrator
    }

    pub fn ingestor(&self) -> &Arc<TelemetryIngestor> {
        &self.ingestor
    }

    pub fn fanout(&self) -> &Arc<RealtimeFanout> {
        &self.fanout
    }

    /// Starts the background tasks, onboards every active station and
    /// connects them all. Stations that fail are logged and skipped.
    pub async fn initialize(&self) -> Result<ConnectSummary> {
        let inbound_rx = self
            .inbound_rx
            .lock()
            .take()
            .ok_or_else(|| Error::InvalidOperation("station core already initialized".into()))?;

        info!("Initializing station core");
        self.spawn_tasks(inbound_rx);

        let stations = self.persistence.get_active_stations().await?;
        info!("Onboarding {} active station(s)", stations.len());
        for station in stations {
            let station_id = station.id;
            if let Err(e) = self.register(station).await {
                error!("Skipping station {}: {}", station_id, e);
            }
        }

        self.orchestrator.attach_transport(Arc::clone(&self.registry));
        let summary = self.registry.connect_all().await;
        CONNECTED_STATIONS.set(self.registry.connected_count().await as f64);
        Ok(summary)
    }

    /// Adds and connects a station while running. A credential problem
    /// leaves the station unlinked.
    pub async fn onboard_station(&self, station: StationRef) -> Result<()> {
        let station_id = station.id;
        self.register(station).await?;
        let link = self
            .registry
            .link(station_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("station {}", station_id)))?;
        link.connect().await?;
        CONNECTED_STATIONS.set(self.registry.connected_count().await as f64);
        info!("Station {} onboarded", station_id);
        Ok(())
    }

    pub async fn offboard_station(&self, station_id: StationId) -> Result<()> {
        self.registry.remove_station(station_id).await?;
        self.ingestor.forget_station(station_id);
        CONNECTED_STATIONS.set(self.registry.connected_count().await as f64);
        info!("Station {} offboarded", station_id);
        Ok(())
    }

    /// Stops the background tasks (flushing what is buffered) and
    /// disconnects every station.
    pub async fn shutdown(&self) {
        info!("Shutting down station core");
        self.cancel.cancel();
        self.orchestrator.detach_transport();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!("Background task failed: {}", e);
            }
        }

        self.registry.disconnect_all().await;
        CONNECTED_STATIONS.set(0.0);
        info!("Station core stopped");
    }

    async fn register(&self, station: StationRef) -> Result<()> {
        let certificate = self.credentials.get_station_certificate(station.id).await?;
        let credentials = StationCredentials::new(&station, certificate)?;

        if !self.registry.add_station(credentials).await {
            return Err(Error::InvalidOperation(format!(
                "station {} is already onboarded",
                station.id
            )));
        }
        self.ingestor.track_station(station.id, station.organization_id);

        for topic in [
            topic::telemetry_topic(station.id),
            topic::serial_telemetry_topic(&station.serial_code),
            topic::command_response_topic(&station.serial_code),
        ] {
            let tx = self.inbound_tx.clone();
            let station_id = station.id;
            let callback: MessageCallback = Arc::new(move |topic: &str, payload: &Payload| {
                let inbound = Inbound {
                    station_id,
                    topic: topic.to_string(),
                    payload: payload.clone(),
                };
                if tx.send(inbound).is_err() {
                    debug!("Inbound router stopped, dropping message on {}", topic);
                }
            });
            self.registry.subscribe(station.id, &topic, callback).await?;
        }
        Ok(())
    }

    fn spawn_tasks(&self, inbound_rx: mpsc::UnboundedReceiver<Inbound>) {
        let mut tasks = self.tasks.lock();

        tasks.push(tokio::spawn(route_inbound(
            inbound_rx,
            Arc::clone(&self.ingestor),
            Arc::clone(&self.orchestrator),
            self.cancel.clone(),
        )));
        tasks.push(tokio::spawn(watch_links(
            self.registry.events(),
            Arc::clone(&self.registry),
            Arc::clone(&self.ingestor),
            self.cancel.clone(),
        )));
        tasks.push(tokio::spawn(
            Arc::clone(&self.fanout).run(self.bus.subscribe(), self.cancel.clone()),
        ));
        tasks.push(tokio::spawn(run_flusher(
            Arc::clone(&self.ingestor),
            self.config.flush_interval,
            self.cancel.clone(),
        )));
        tasks.push(tokio::spawn(run_liveness_sweep(
            Arc::clone(&self.ingestor),
            Arc::clone(&self.orchestrator),
            self.config.liveness_interval,
            self.cancel.clone(),
        )));
    }
}

/// Sends each inbound message to the ingestor or the orchestrator based on
/// its topic.
async fn route_inbound(
    mut rx: mpsc::UnboundedReceiver<Inbound>,
    ingestor: Arc<TelemetryIngestor>,
    orchestrator: Arc<CommandOrchestrator>,
    cancel: CancellationToken,
) {
    loop {
        let inbound = tokio::select! {
            _ = cancel.cancelled() => break,
            inbound = rx.recv() => match inbound {
                Some(inbound) => inbound,
                None => break,
            },
        };
        let Inbound {
            station_id,
            topic,
            payload,
        } = inbound;

        match topic::classify(&topic) {
            Route::Telemetry => {
                if let Err(e) = ingestor.ingest_payload(station_id, &payload) {
                    INVALID_MESSAGES_TOTAL.inc();
                    warn!("Rejected telemetry from station {} on {}: {}", station_id, topic, e);
                }
            }
            Route::CommandResponse => {
                if let Err(e) = orchestrator.handle_station_message(station_id, &payload).await {
                    warn!(
                        "Could not apply command response from station {}: {}",
                        station_id, e
                    );
                }
            }
            Route::Command => {
                // Only ever our own outbound command; links never subscribe to it.
                debug!("Ignoring outbound command echo on {}", topic);
            }
            Route::Other => {
                INVALID_MESSAGES_TOTAL.inc();
                debug!("No route for {} from station {}", topic, station_id);
            }
        }
    }
    info!("Inbound router stopped");
}

/// Follows link lifecycle events: a connect counts as the station being
/// seen, and the connected gauge tracks every change.
async fn watch_links(
    mut events: broadcast::Receiver<StationEvent>,
    registry: Arc<LinkRegistry>,
    ingestor: Arc<TelemetryIngestor>,
    cancel: CancellationToken,
) {
    loop {
        let StationEvent { station_id, event } = tokio::select! {
            _ = cancel.cancelled() => break,
            received = events.recv() => match received {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Link watcher lagged, skipped {} event(s)", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        match event {
            LinkEvent::Connected => {
                ingestor.mark_seen(station_id, Utc::now());
                CONNECTED_STATIONS.set(registry.connected_count().await as f64);
            }
            LinkEvent::Disconnected | LinkEvent::Offline | LinkEvent::Reconnecting => {
                CONNECTED_STATIONS.set(registry.connected_count().await as f64);
            }
            LinkEvent::Error(reason) => warn!("Station {} link error: {}", station_id, reason),
            LinkEvent::Message { .. } => {}
        }
    }
    info!("Link watcher stopped");
}
