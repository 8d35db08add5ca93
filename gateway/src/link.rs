use parking_lot::Mutex;
use rumqttc::QoS;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::errors::{Error, Result};
use crate::events::LinkEvent;
use crate::metrics::{DEGRADED_MESSAGES_TOTAL, MESSAGES_TOTAL};
use crate::model::{Payload, StationCredentials, StationId};
use crate::session::{MqttSession, PublishOptions, SessionEvent, SessionFactory};
use crate::topic;

pub type MessageCallback = Arc<dyn Fn(&str, &Payload) + Send + Sync>;
pub type SubscriptionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub connect_timeout: Duration,
    pub subscribe_qos: QoS,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            subscribe_qos: QoS::AtMostOnce,
        }
    }
}

struct LinkState {
    // Bumped whenever a session is opened or abandoned; events from older
    // sessions are dropped.
    epoch: u64,
    reconnect_attempts: u32,
    subscriptions: HashMap<String, Vec<(SubscriptionId, MessageCallback)>>,
    next_subscription: SubscriptionId,
    session: Option<Arc<dyn MqttSession>>,
}

/// One station's MQTT session and the callbacks listening on it.
pub struct StationLink {
    credentials: StationCredentials,
    factory: Arc<dyn SessionFactory>,
    config: LinkConfig,
    state: Mutex<LinkState>,
    status: watch::Sender<ConnectionStatus>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl StationLink {
    pub fn new(
        credentials: StationCredentials,
        factory: Arc<dyn SessionFactory>,
        config: LinkConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);

        let link = Arc::new(Self {
            credentials,
            factory,
            config,
            state: Mutex::new(LinkState {
                epoch: 0,
                reconnect_attempts: 0,
                subscriptions: HashMap::new(),
                next_subscription: 1,
                session: None,
            }),
            status,
            events,
        });
        (link, rx)
    }

    pub fn station_id(&self) -> StationId {
        self.credentials.station_id
    }

    pub fn serial_code(&self) -> &str {
        &self.credentials.serial_code
    }

    pub fn credentials(&self) -> &StationCredentials {
        &self.credentials
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.status.borrow() == ConnectionStatus::Connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.state.lock().reconnect_attempts
    }

    /// Opens the session and waits for the broker to accept it.
    ///
    /// Returns immediately when already connected. Callers arriving while an
    /// attempt is in flight wait on that same attempt.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let mut status_rx = self.status.subscribe();

        let (epoch, opened_here) = {
            let mut state = self.state.lock();
            let current = self.status.borrow().clone();
            match current {
                ConnectionStatus::Connected => return Ok(()),
                ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => {
                    (state.epoch, false)
                }
                ConnectionStatus::Disconnected | ConnectionStatus::Failed(_) => {
                    let handle = match self.factory.open(&self.credentials) {
                        Ok(handle) => handle,
                        Err(e) => {
                            self.status
                                .send_replace(ConnectionStatus::Failed(e.to_string()));
                            return Err(e);
                        }
                    };
                    state.epoch += 1;
                    state.session = Some(handle.session);
                    self.status.send_replace(ConnectionStatus::Connecting);
                    tokio::spawn(Arc::clone(self).pump(state.epoch, handle.events));
                    (state.epoch, true)
                }
            }
        };

        let waited = tokio::time::timeout(self.config.connect_timeout, async {
            loop {
                let current = status_rx.borrow_and_update().clone();
                match current {
                    ConnectionStatus::Connected => return Ok(()),
                    ConnectionStatus::Failed(reason) => return Err(Error::Connection(reason)),
                    ConnectionStatus::Disconnected => return Err(Error::NotConnected),
                    ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => {}
                }
                if status_rx.changed().await.is_err() {
                    return Err(Error::NotConnected);
                }
            }
        })
        .await;

        let result = match waited {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectTimeout(self.config.connect_timeout.as_secs())),
        };

        if let Err(e) = &result {
            if opened_here {
                self.abandon(epoch, e.to_string()).await;
            }
        }
        result
    }

    /// Drops a failed first attempt so the next `connect` starts clean.
    async fn abandon(&self, epoch: u64, reason: String) {
        let session = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return;
            }
            state.epoch += 1;
            self.status.send_replace(ConnectionStatus::Failed(reason));
            state.session.take()
        };

        if let Some(session) = session {
            if let Err(e) = session.disconnect().await {
                debug!(
                    "Closing abandoned session for station {} failed: {}",
                    self.station_id(),
                    e
                );
            }
        }
    }

    pub async fn disconnect(&self) -> Result<()> {
        let session = {
            let mut state = self.state.lock();
            state.epoch += 1;
            self.status.send_replace(ConnectionStatus::Disconnected);
            state.session.take()
        };

        if let Some(session) = session {
            info!("Disconnecting station {}", self.station_id());
            let result = session.disconnect().await;
            self.emit(LinkEvent::Disconnected);
            result?;
        }
        Ok(())
    }

    /// Registers `callback` for `topic`, which may contain wildcards. The
    /// broker subscription is made for the first callback only, and again on
    /// every reconnect.
    pub async fn subscribe(&self, topic: &str, callback: MessageCallback) -> SubscriptionId {
        let (id, session) = {
            let mut state = self.state.lock();
            let id = state.next_subscription;
            state.next_subscription += 1;

            let callbacks = state.subscriptions.entry(topic.to_string()).or_default();
            let first = callbacks.is_empty();
            callbacks.push((id, callback));

            let session = if first && self.is_connected() {
                state.session.clone()
            } else {
                None
            };
            (id, session)
        };

        if let Some(session) = session {
            match session.subscribe(topic, self.config.subscribe_qos).await {
                Ok(()) => debug!("Station {} subscribed to {}", self.station_id(), topic),
                Err(e) => warn!(
                    "Station {} failed to subscribe to {} (will retry on reconnect): {}",
                    self.station_id(),
                    topic,
                    e
                ),
            }
        }
        id
    }

    /// Removes one callback, or every callback when `id` is `None`. Returns
    /// whether anything was removed.
    pub async fn unsubscribe(&self, topic: &str, id: Option<SubscriptionId>) -> bool {
        let (removed, session) = {
            let mut state = self.state.lock();
            let Some(callbacks) = state.subscriptions.get_mut(topic) else {
                return false;
            };

            let before = callbacks.len();
            match id {
                Some(id) => callbacks.retain(|(existing, _)| *existing != id),
                None => callbacks.clear(),
            }
            let removed = callbacks.len() != before;

            let session = if callbacks.is_empty() {
                state.subscriptions.remove(topic);
                if self.is_connected() {
                    state.session.clone()
                } else {
                    None
                }
            } else {
                None
            };
            (removed, session)
        };

        if let Some(session) = session {
            if let Err(e) = session.unsubscribe(topic).await {
                warn!(
                    "Station {} failed to unsubscribe from {}: {}",
                    self.station_id(),
                    topic,
                    e
                );
            }
        }
        removed
    }

    /// Publishes `payload`. Strings go out verbatim, anything else as JSON.
    pub async fn publish<T>(&self, topic: &str, payload: &T, options: PublishOptions) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let bytes = match serde_json::to_value(payload)? {
            Value::String(text) => text.into_bytes(),
            value => serde_json::to_vec(&value)?,
        };

        let session = {
            let state = self.state.lock();
            if !self.is_connected() {
                return Err(Error::NotConnected);
            }
            state.session.clone().ok_or(Error::NotConnected)?
        };

        session.publish(topic, bytes, options).await
    }

    async fn pump(self: Arc<Self>, epoch: u64, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            if self.state.lock().epoch != epoch {
                debug!(
                    "Ignoring event from abandoned session of station {}",
                    self.station_id()
                );
                return;
            }

            match event {
                SessionEvent::Connected => self.on_connected(epoch).await,
                SessionEvent::Disconnected => {
                    self.set_status_if_current(epoch, ConnectionStatus::Reconnecting);
                    self.emit(LinkEvent::Disconnected);
                }
                SessionEvent::Reconnecting => {
                    {
                        let mut state = self.state.lock();
                        state.reconnect_attempts += 1;
                    }
                    if !matches!(self.status(), ConnectionStatus::Connecting) {
                        self.set_status_if_current(epoch, ConnectionStatus::Reconnecting);
                    }
                    self.emit(LinkEvent::Reconnecting);
                }
                SessionEvent::Offline => {
                    self.set_status_if_current(epoch, ConnectionStatus::Reconnecting);
                    self.emit(LinkEvent::Offline);
                }
                SessionEvent::Error(reason) => {
                    if matches!(self.status(), ConnectionStatus::Connecting) {
                        self.set_status_if_current(epoch, ConnectionStatus::Failed(reason.clone()));
                    }
                    self.emit(LinkEvent::Error(reason));
                }
                SessionEvent::Message { topic, payload } => {
                    let payload = Payload::parse(&payload);
                    self.dispatch(&topic, &payload);
                    self.emit(LinkEvent::Message { topic, payload });
                }
            }
        }

        let mut state = self.state.lock();
        if state.epoch == epoch {
            state.session = None;
            self.status.send_replace(ConnectionStatus::Disconnected);
        }
    }

    async fn on_connected(&self, epoch: u64) {
        let (topics, session) = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return;
            }
            state.reconnect_attempts = 0;
            self.status.send_replace(ConnectionStatus::Connected);
            let topics: Vec<String> = state.subscriptions.keys().cloned().collect();
            (topics, state.session.clone())
        };

        info!(
            "Station {} connected as {}",
            self.station_id(),
            self.credentials.client_id
        );

        // Clean sessions forget subscriptions, so replay them every time.
        if let Some(session) = session {
            for topic in &topics {
                if let Err(e) = session.subscribe(topic, self.config.subscribe_qos).await {
                    warn!(
                        "Station {} failed to restore subscription {}: {}",
                        self.station_id(),
                        topic,
                        e
                    );
                }
            }
        }
        self.emit(LinkEvent::Connected);
    }

    fn set_status_if_current(&self, epoch: u64, status: ConnectionStatus) {
        let state = self.state.lock();
        if state.epoch == epoch {
            self.status.send_replace(status);
        }
    }

    /// Runs the callbacks for the exact topic first, then those of every
    /// wildcard subscription that also matches.
    fn dispatch(&self, topic: &str, payload: &Payload) {
        MESSAGES_TOTAL.inc();
        if payload.is_degraded() {
            DEGRADED_MESSAGES_TOTAL.inc();
            warn!(
                "Station {} sent non-JSON payload on {}, forwarding raw text",
                self.station_id(),
                topic
            );
        }

        let callbacks: Vec<MessageCallback> = {
            let state = self.state.lock();
            let exact = state
                .subscriptions
                .get(topic)
                .into_iter()
                .flatten()
                .map(|(_, callback)| Arc::clone(callback));
            let wildcard = state
                .subscriptions
                .iter()
                .filter(|(pattern, _)| pattern.as_str() != topic && topic::matches(topic, pattern))
                .flat_map(|(_, callbacks)| callbacks.iter().map(|(_, cb)| Arc::clone(cb)));
            exact.chain(wildcard).collect()
        };

        for callback in callbacks {
            supervised_call(self.station_id(), topic, || callback(topic, payload));
        }
    }

    fn emit(&self, event: LinkEvent) {
        if self.events.send(event).is_err() {
            debug!("No listener for events of station {}", self.station_id());
        }
    }
}

/// Runs one subscriber callback, containing any panic so the remaining
/// callbacks still get the message.
pub fn supervised_call<F: FnOnce()>(station_id: StationId, topic: &str, f: F) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(cause) => {
            let reason = cause
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| cause.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(
                "Callback for station {} on {} panicked: {}",
                station_id, topic, reason
            );
            false
        }
    }
}
