//! MQTT sessions as seen by a station link.
//!
//! A [`SessionFactory`] turns station credentials into a live session plus a
//! stream of [`SessionEvent`]s. [`RumqttFactory`] talks to the real broker
//! over mutual TLS; [`MemoryFactory`] is an in-process loopback used by the
//! tests and for running the gateway without a broker.

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{Error, Result};
use crate::model::{StationCredentials, StationId};

/// Raw notifications coming out of one MQTT client.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Reconnecting,
    Offline,
    Error(String),
    Message { topic: String, payload: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }
}

#[async_trait]
pub trait MqttSession: Send + Sync {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;
    async fn unsubscribe(&self, topic: &str) -> Result<()>;
    async fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
}

pub struct SessionHandle {
    pub session: Arc<dyn MqttSession>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

pub trait SessionFactory: Send + Sync {
    /// Starts a session. The connection outcome arrives later as an event.
    fn open(&self, credentials: &StationCredentials) -> Result<SessionHandle>;
}

#[derive(Debug, Clone)]
pub struct RumqttFactory {
    pub endpoint: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
    pub channel_capacity: usize,
}

impl SessionFactory for RumqttFactory {
    fn open(&self, credentials: &StationCredentials) -> Result<SessionHandle> {
        credentials.certificate.validate()?;

        let mut mqtt_options =
            MqttOptions::new(credentials.client_id.clone(), self.endpoint.clone(), self.port);
        mqtt_options.set_keep_alive(self.keep_alive);
        mqtt_options.set_clean_session(true);
        mqtt_options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
            ca: credentials.certificate.root_ca_pem.clone(),
            alpn: None,
            client_auth: Some((
                credentials.certificate.cert_pem.clone(),
                credentials.certificate.key_pem.clone(),
            )),
        }));

        let (client, eventloop) = AsyncClient::new(mqtt_options, self.channel_capacity);
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        info!(
            "Opening MQTT session for station {} ({}) at {}:{}",
            credentials.station_id, credentials.client_id, self.endpoint, self.port
        );

        let pump = tokio::spawn(run_eventloop(
            eventloop,
            tx,
            cancel.clone(),
            self.reconnect_delay,
            credentials.station_id,
        ));

        Ok(SessionHandle {
            session: Arc::new(RumqttSession {
                client,
                cancel,
                pump: Mutex::new(Some(pump)),
            }),
            events: rx,
        })
    }
}

struct RumqttSession {
    client: AsyncClient,
    cancel: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl MqttSession for RumqttSession {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        self.client.subscribe(topic, qos).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.client.unsubscribe(topic).await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) -> Result<()> {
        self.client
            .publish(topic, options.qos, options.retain, payload)
            .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let requested = self.client.disconnect().await;
        let pump = self.pump.lock().take();

        if let Some(mut pump) = pump {
            // Give the event loop a moment to flush the DISCONNECT packet.
            if requested.is_err()
                || tokio::time::timeout(Duration::from_secs(1), &mut pump)
                    .await
                    .is_err()
            {
                self.cancel.cancel();
                pump.abort();
            }
        }
        self.cancel.cancel();
        requested.map_err(Error::from)
    }
}

impl Drop for RumqttSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_eventloop(
    mut eventloop: EventLoop,
    tx: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
    reconnect_delay: Duration,
    station_id: StationId,
) {
    let mut connected = false;

    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        let event = match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    connected = true;
                    SessionEvent::Connected
                } else {
                    SessionEvent::Error(format!("connection refused: {:?}", ack.code))
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Station {} received message on topic {}, size: {} bytes",
                    station_id,
                    publish.topic,
                    publish.payload.len()
                );
                SessionEvent::Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                connected = false;
                SessionEvent::Disconnected
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                let _ = tx.send(SessionEvent::Disconnected);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                if cancel.is_cancelled() {
                    break;
                }
                error!("MQTT error for station {}: {}", station_id, e);
                let _ = tx.send(SessionEvent::Error(e.to_string()));
                if connected {
                    connected = false;
                    let _ = tx.send(SessionEvent::Offline);
                }

                // rumqttc reconnects on the next poll
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
                SessionEvent::Reconnecting
            }
        };

        if tx.send(event).is_err() {
            debug!("Station {} link dropped its session events", station_id);
            break;
        }
    }

    debug!("Event loop for station {} stopped", station_id);
}

/// How the in-memory broker answers a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectBehaviour {
    #[default]
    Accept,
    Refuse(String),
    /// Never answers, so the caller runs into its connect timeout.
    Silent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub station_id: StationId,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

#[derive(Default)]
struct MemoryBroker {
    behaviours: HashMap<StationId, ConnectBehaviour>,
    sessions: HashMap<StationId, mpsc::UnboundedSender<SessionEvent>>,
    subscriptions: HashMap<StationId, Vec<String>>,
    published: Vec<PublishedMessage>,
    failing_publish: HashSet<StationId>,
    opened: HashMap<StationId, usize>,
}

/// Loopback broker: records what links send and lets callers inject what
/// stations would send back.
#[derive(Clone, Default)]
pub struct MemoryFactory {
    broker: Arc<Mutex<MemoryBroker>>,
}

impl MemoryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behaviour(&self, station_id: StationId, behaviour: ConnectBehaviour) {
        self.broker.lock().behaviours.insert(station_id, behaviour);
    }

    pub fn fail_publishes(&self, station_id: StationId, fail: bool) {
        let mut broker = self.broker.lock();
        if fail {
            broker.failing_publish.insert(station_id);
        } else {
            broker.failing_publish.remove(&station_id);
        }
    }

    /// Delivers a message to the station's open session, if any.
    pub fn inject(&self, station_id: StationId, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        self.emit(
            station_id,
            SessionEvent::Message {
                topic: topic.to_string(),
                payload: payload.into(),
            },
        )
    }

    /// Pushes an arbitrary session event, e.g. to simulate a dropped
    /// connection followed by a reconnect. A drop wipes the station's
    /// subscriptions the way a clean-session broker does.
    pub fn emit(&self, station_id: StationId, event: SessionEvent) -> bool {
        let mut broker = self.broker.lock();
        if matches!(event, SessionEvent::Offline | SessionEvent::Disconnected) {
            broker.subscriptions.remove(&station_id);
        }
        match broker.sessions.get(&station_id) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.broker.lock().published.clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.broker
            .lock()
            .published
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    pub fn subscriptions(&self, station_id: StationId) -> Vec<String> {
        self.broker
            .lock()
            .subscriptions
            .get(&station_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn open_count(&self, station_id: StationId) -> usize {
        self.broker
            .lock()
            .opened
            .get(&station_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_open(&self, station_id: StationId) -> bool {
        self.broker.lock().sessions.contains_key(&station_id)
    }
}

impl SessionFactory for MemoryFactory {
    fn open(&self, credentials: &StationCredentials) -> Result<SessionHandle> {
        let station_id = credentials.station_id;
        let (tx, rx) = mpsc::unbounded_channel();

        let mut broker = self.broker.lock();
        *broker.opened.entry(station_id).or_default() += 1;
        broker.subscriptions.remove(&station_id);
        match broker.behaviours.get(&station_id).cloned().unwrap_or_default() {
            ConnectBehaviour::Accept => {
                let _ = tx.send(SessionEvent::Connected);
            }
            ConnectBehaviour::Refuse(reason) => {
                let _ = tx.send(SessionEvent::Error(reason));
            }
            ConnectBehaviour::Silent => {}
        }
        broker.sessions.insert(station_id, tx);

        Ok(SessionHandle {
            session: Arc::new(MemorySession {
                station_id,
                broker: Arc::clone(&self.broker),
            }),
            events: rx,
        })
    }
}

struct MemorySession {
    station_id: StationId,
    broker: Arc<Mutex<MemoryBroker>>,
}

#[async_trait]
impl MqttSession for MemorySession {
    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<()> {
        let mut broker = self.broker.lock();
        let topics = broker.subscriptions.entry(self.station_id).or_default();
        if !topics.iter().any(|t| t == topic) {
            topics.push(topic.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        if let Some(topics) = self.broker.lock().subscriptions.get_mut(&self.station_id) {
            topics.retain(|t| t != topic);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) -> Result<()> {
        let mut broker = self.broker.lock();
        if broker.failing_publish.contains(&self.station_id) {
            warn!("Memory broker rejecting publish for station {}", self.station_id);
            return Err(Error::Connection(format!(
                "publish to {} rejected by broker",
                topic
            )));
        }
        broker.published.push(PublishedMessage {
            station_id: self.station_id,
            topic: topic.to_string(),
            payload,
            qos: options.qos,
            retain: options.retain,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(tx) = self.broker.lock().sessions.remove(&self.station_id) {
            let _ = tx.send(SessionEvent::Disconnected);
        }
        Ok(())
    }
}
