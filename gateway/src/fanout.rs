//! Pushes core events to realtime subscribers grouped by station,
//! organisation and user.

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::events::CoreEvent;
use crate::model::{OrganizationId, StationId, UserId};

pub type SubscriberId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    Station(StationId),
    Organization(OrganizationId),
    User(UserId),
}

/// The realtime edge (WebSocket server or similar). Delivery problems are
/// its own business.
pub trait RealtimeTransport: Send + Sync {
    fn deliver(&self, subscriber: SubscriberId, event: &str, payload: &Value);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outbound {
    pub subscriber: SubscriberId,
    pub event: String,
    pub payload: Value,
}

/// Hands every delivery to a tokio broadcast channel for the socket layer to
/// pick up.
#[derive(Debug, Clone)]
pub struct BroadcastTransport {
    tx: broadcast::Sender<Outbound>,
}

impl BroadcastTransport {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.tx.subscribe()
    }
}

impl RealtimeTransport for BroadcastTransport {
    fn deliver(&self, subscriber: SubscriberId, event: &str, payload: &Value) {
        let _ = self.tx.send(Outbound {
            subscriber,
            event: event.to_string(),
            payload: payload.clone(),
        });
    }
}

pub struct RealtimeFanout {
    groups: RwLock<HashMap<Group, HashSet<SubscriberId>>>,
    transport: Arc<dyn RealtimeTransport>,
}

impl RealtimeFanout {
    pub fn new(transport: Arc<dyn RealtimeTransport>) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            transport,
        }
    }

    pub fn join(&self, subscriber: SubscriberId, group: Group) {
        self.groups.write().entry(group).or_default().insert(subscriber);
        debug!("Subscriber {} joined {:?}", subscriber, group);
    }

    pub fn leave(&self, subscriber: SubscriberId, group: Group) {
        let mut groups = self.groups.write();
        if let Some(members) = groups.get_mut(&group) {
            members.remove(&subscriber);
            if members.is_empty() {
                groups.remove(&group);
            }
        }
    }

    pub fn join_station(&self, subscriber: SubscriberId, station_id: StationId) {
        self.join(subscriber, Group::Station(station_id));
    }

    pub fn join_organization(&self, subscriber: SubscriberId, organization_id: OrganizationId) {
        self.join(subscriber, Group::Organization(organization_id));
    }

    pub fn join_user(&self, subscriber: SubscriberId, user_id: UserId) {
        self.join(subscriber, Group::User(user_id));
    }

    /// Removes a subscriber from every group, e.g. when its socket closes.
    pub fn remove_subscriber(&self, subscriber: SubscriberId) {
        self.groups.write().retain(|_, members| {
            members.remove(&subscriber);
            !members.is_empty()
        });
    }

    pub fn members(&self, group: Group) -> usize {
        self.groups.read().get(&group).map_or(0, HashSet::len)
    }

    fn broadcast(&self, group: Group, event: &str, payload: &Value) -> usize {
        let members: Vec<SubscriberId> = match self.groups.read().get(&group) {
            Some(members) => members.iter().copied().collect(),
            None => return 0,
        };
        for subscriber in &members {
            self.transport.deliver(*subscriber, event, payload);
        }
        trace!("Sent {} to {} member(s) of {:?}", event, members.len(), group);
        members.len()
    }

    pub fn broadcast_to_station(&self, station_id: StationId, event: &str, payload: &Value) -> usize {
        self.broadcast(Group::Station(station_id), event, payload)
    }

    pub fn broadcast_to_organization(
        &self,
        organization_id: OrganizationId,
        event: &str,
        payload: &Value,
    ) -> usize {
        self.broadcast(Group::Organization(organization_id), event, payload)
    }

    pub fn broadcast_to_user(&self, user_id: UserId, event: &str, payload: &Value) -> usize {
        self.broadcast(Group::User(user_id), event, payload)
    }

    fn to_station_and_organization(
        &self,
        station_id: StationId,
        organization_id: Option<OrganizationId>,
        event: &str,
        payload: &Value,
    ) {
        self.broadcast_to_station(station_id, event, payload);
        if let Some(organization_id) = organization_id {
            self.broadcast_to_organization(organization_id, event, payload);
        }
    }

    pub fn handle_event(&self, event: &CoreEvent) {
        let station_id = event.station_id();
        match event {
            CoreEvent::Telemetry {
                organization_id,
                sample,
            } => {
                let payload = json!(sample);
                self.to_station_and_organization(station_id, *organization_id, "telemetry", &payload);
            }
            CoreEvent::Aggregate { aggregate, .. } => {
                self.broadcast_to_station(station_id, "aggregate", &json!(aggregate));
            }
            CoreEvent::ThresholdExceeded {
                organization_id,
                alert,
            } => {
                let payload = json!({ "type": "threshold", "alert": alert });
                self.to_station_and_organization(station_id, *organization_id, "alert", &payload);
            }
            CoreEvent::StatusChanged {
                organization_id,
                previous,
                status,
                last_seen,
                ..
            } => {
                let payload = json!({
                    "stationId": station_id,
                    "previous": previous,
                    "status": status,
                    "lastSeen": last_seen,
                });
                self.to_station_and_organization(
                    station_id,
                    *organization_id,
                    "station_status",
                    &payload,
                );
            }
            CoreEvent::ConnectionLost {
                organization_id,
                status,
                last_seen,
                ..
            } => {
                let payload = json!({
                    "type": "connection_lost",
                    "stationId": station_id,
                    "status": status,
                    "lastSeen": last_seen,
                });
                self.to_station_and_organization(station_id, *organization_id, "alert", &payload);
            }
            CoreEvent::CommandStatus { change, command } => {
                let payload = json!(command);
                self.broadcast_to_station(station_id, change.event_name(), &payload);
                self.broadcast_to_user(command.issued_by, change.event_name(), &payload);
            }
        }
    }

    /// Forwards bus events until cancelled or the bus closes.
    pub async fn run(self: Arc<Self>, mut rx: broadcast::Receiver<CoreEvent>, cancel: CancellationToken) {
        info!("Realtime fanout started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => self.handle_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Realtime fanout lagged, skipped {} event(s)", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!("Realtime fanout stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CommandChange, ThresholdAlert};
    use crate::model::{Command, CommandStatus, CommandType, TelemetrySample};
    use chrono::Utc;

    fn fanout() -> (RealtimeFanout, broadcast::Receiver<Outbound>) {
        let transport = BroadcastTransport::new(64);
        let rx = transport.subscribe();
        (RealtimeFanout::new(Arc::new(transport)), rx)
    }

    fn drain(rx: &mut broadcast::Receiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    #[test]
    fn test_broadcast_reaches_group_members_only() {
        let (fanout, mut rx) = fanout();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        fanout.join_station(a, 1);
        fanout.join_station(b, 1);
        fanout.join_station(c, 2);

        let sent = fanout.broadcast_to_station(1, "telemetry", &json!({"t": 1}));

        assert_eq!(sent, 2);
        let mut receivers: Vec<SubscriberId> = drain(&mut rx).iter().map(|o| o.subscriber).collect();
        receivers.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(receivers, expected);
        assert_eq!(fanout.broadcast_to_user(9, "x", &json!(null)), 0);
    }

    #[test]
    fn test_remove_subscriber_leaves_every_group() {
        let (fanout, _rx) = fanout();
        let a = Uuid::new_v4();
        fanout.join_station(a, 1);
        fanout.join_organization(a, 10);
        fanout.join_user(a, 100);

        fanout.remove_subscriber(a);

        assert_eq!(fanout.members(Group::Station(1)), 0);
        assert_eq!(fanout.members(Group::Organization(10)), 0);
        assert_eq!(fanout.members(Group::User(100)), 0);
    }

    #[test]
    fn test_leave_single_group() {
        let (fanout, _rx) = fanout();
        let a = Uuid::new_v4();
        fanout.join_station(a, 1);
        fanout.join_station(a, 2);
        fanout.leave(a, Group::Station(1));
        assert_eq!(fanout.members(Group::Station(1)), 0);
        assert_eq!(fanout.members(Group::Station(2)), 1);
    }

    #[test]
    fn test_telemetry_goes_to_station_and_organization() {
        let (fanout, mut rx) = fanout();
        let (watcher, admin) = (Uuid::new_v4(), Uuid::new_v4());
        fanout.join_station(watcher, 1);
        fanout.join_organization(admin, 7);

        let mut sample = TelemetrySample::empty(1, Utc::now());
        sample.temperature = Some(21.5);
        fanout.handle_event(&CoreEvent::Telemetry {
            organization_id: Some(7),
            sample,
        });

        let out = drain(&mut rx);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|o| o.event == "telemetry"));
        assert_eq!(out[0].payload["temperature"], json!(21.5));
    }

    #[test]
    fn test_threshold_alert_payload() {
        let (fanout, mut rx) = fanout();
        fanout.join_station(Uuid::new_v4(), 1);

        fanout.handle_event(&CoreEvent::ThresholdExceeded {
            organization_id: None,
            alert: ThresholdAlert {
                station_id: 1,
                field: "humidity",
                value: 120.0,
                min: 0.0,
                max: 100.0,
                recorded_at: Utc::now(),
            },
        });

        let out = drain(&mut rx);
        assert_eq!(out[0].event, "alert");
        assert_eq!(out[0].payload["type"], json!("threshold"));
        assert_eq!(out[0].payload["alert"]["field"], json!("humidity"));
    }

    #[test]
    fn test_command_events_reach_issuer() {
        let (fanout, mut rx) = fanout();
        let issuer = Uuid::new_v4();
        fanout.join_user(issuer, 55);

        fanout.handle_event(&CoreEvent::CommandStatus {
            change: CommandChange::Executed,
            command: Command {
                id: 3,
                station_id: 1,
                command_type: CommandType::Reset,
                payload: json!({"command": "reset"}),
                status: CommandStatus::Executed,
                issued_by: 55,
                created_at: Utc::now(),
                sent_at: Some(Utc::now()),
                executed_at: Some(Utc::now()),
                response: Some(json!({"ok": true})),
                attempt: 1,
            },
        });

        let out = drain(&mut rx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].subscriber, issuer);
        assert_eq!(out[0].event, "command_executed");
        assert_eq!(out[0].payload["status"], json!("EXECUTED"));
        assert_eq!(out[0].payload["type"], json!("RESET"));
    }
}
