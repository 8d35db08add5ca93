use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::aggregate::StationAggregate;
use crate::model::{
    Command, LivenessStatus, OrganizationId, Payload, StationId, TelemetrySample,
};

/// Lifecycle and traffic of one station link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    Reconnecting,
    Offline,
    Error(String),
    Message { topic: String, payload: Payload },
}

/// A link event re-emitted by the registry with its origin attached.
#[derive(Debug, Clone, PartialEq)]
pub struct StationEvent {
    pub station_id: StationId,
    pub event: LinkEvent,
}

/// Why a command event was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandChange {
    Created,
    Undelivered,
    Sent,
    Executed,
    Failed,
    TimedOut,
    Cancelled,
    Retried,
}

impl CommandChange {
    pub fn event_name(self) -> &'static str {
        match self {
            CommandChange::Created => "command_created",
            CommandChange::Undelivered => "command_undelivered",
            CommandChange::Sent => "command_sent",
            CommandChange::Executed => "command_executed",
            CommandChange::Failed => "command_failed",
            CommandChange::TimedOut => "command_timeout",
            CommandChange::Cancelled => "command_cancelled",
            CommandChange::Retried => "command_retried",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdAlert {
    pub station_id: StationId,
    pub field: &'static str,
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Everything the ingestor and the orchestrator announce to the rest of the
/// process.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    Telemetry {
        organization_id: Option<OrganizationId>,
        sample: TelemetrySample,
    },
    Aggregate {
        organization_id: Option<OrganizationId>,
        aggregate: StationAggregate,
    },
    ThresholdExceeded {
        organization_id: Option<OrganizationId>,
        alert: ThresholdAlert,
    },
    StatusChanged {
        station_id: StationId,
        organization_id: Option<OrganizationId>,
        previous: Option<LivenessStatus>,
        status: LivenessStatus,
        last_seen: DateTime<Utc>,
    },
    ConnectionLost {
        station_id: StationId,
        organization_id: Option<OrganizationId>,
        status: LivenessStatus,
        last_seen: DateTime<Utc>,
    },
    CommandStatus {
        change: CommandChange,
        command: Command,
    },
}

impl CoreEvent {
    pub fn station_id(&self) -> StationId {
        match self {
            CoreEvent::Telemetry { sample, .. } => sample.station_id,
            CoreEvent::Aggregate { aggregate, .. } => aggregate.station_id,
            CoreEvent::ThresholdExceeded { alert, .. } => alert.station_id,
            CoreEvent::StatusChanged { station_id, .. }
            | CoreEvent::ConnectionLost { station_id, .. } => *station_id,
            CoreEvent::CommandStatus { command, .. } => command.station_id,
        }
    }
}

/// In-process publish/subscribe bus for [`CoreEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: CoreEvent) {
        // No receivers is fine: nobody is listening yet.
        if self.tx.send(event).is_err() {
            trace!("Event published with no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
