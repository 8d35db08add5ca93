use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::errors::{Error, Result};
use crate::events::{CommandChange, CoreEvent, EventBus};
use crate::metrics::{COMMAND_TRANSITIONS_TOTAL, DB_FAILURES_TOTAL};
use crate::model::{
    Command, CommandId, CommandStatus, CommandType, CommandUpdate, NewCommand, Payload, StationId,
    UserId,
};
use crate::persistence::Persistence;
use crate::registry::LinkRegistry;
use crate::session::PublishOptions;
use crate::topic;

/// Body published on `station/{serial}/command`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundCommand<'a> {
    command_id: CommandId,
    #[serde(rename = "type")]
    command_type: CommandType,
    command: &'a Value,
    timestamp: DateTime<Utc>,
    /// Milliseconds the station has to answer.
    timeout: u64,
}

/// Drives every command through PENDING -> SENT -> EXECUTED / FAILED /
/// TIMEOUT and keeps the store and the event bus informed.
pub struct CommandOrchestrator {
    persistence: Arc<dyn Persistence>,
    bus: EventBus,
    transport: RwLock<Option<Arc<LinkRegistry>>>,
    commands: Mutex<HashMap<CommandId, Command>>,
    /// Held from a transition until its row is written, so updates for one
    /// command reach the store in the order they were made.
    write_locks: Mutex<HashMap<CommandId, Arc<AsyncMutex<()>>>>,
    timeout: Duration,
}

impl CommandOrchestrator {
    pub fn new(persistence: Arc<dyn Persistence>, bus: EventBus, timeout: Duration) -> Self {
        Self {
            persistence,
            bus,
            transport: RwLock::new(None),
            commands: Mutex::new(HashMap::new()),
            write_locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn attach_transport(&self, registry: Arc<LinkRegistry>) {
        *self.transport.write() = Some(registry);
        info!("Command transport attached");
    }

    pub fn detach_transport(&self) {
        if self.transport.write().take().is_some() {
            info!("Command transport detached");
        }
    }

    pub fn has_transport(&self) -> bool {
        self.transport.read().is_some()
    }

    pub fn get(&self, id: CommandId) -> Option<Command> {
        self.commands.lock().get(&id).cloned()
    }

    /// Non-terminal commands for a station, oldest first.
    pub fn outstanding(&self, station_id: StationId) -> Vec<Command> {
        let mut outstanding: Vec<Command> = self
            .commands
            .lock()
            .values()
            .filter(|c| c.station_id == station_id && !c.status.is_terminal())
            .cloned()
            .collect();
        outstanding.sort_by_key(|c| c.id);
        outstanding
    }

    /// Persists a new PENDING command and tries to deliver it straight away.
    pub async fn create(
        self: &Arc<Self>,
        station_id: StationId,
        payload: Value,
        issued_by: UserId,
    ) -> Result<Command> {
        let command_type = CommandType::from_payload(&payload)?;
        let new = NewCommand {
            station_id,
            command_type,
            payload,
            issued_by,
            created_at: Utc::now(),
        };
        let id = self.persistence.create_command(&new).await?;

        let command = Command {
            id,
            station_id,
            command_type,
            payload: new.payload,
            status: CommandStatus::Pending,
            issued_by,
            created_at: new.created_at,
            sent_at: None,
            executed_at: None,
            response: None,
            attempt: 0,
        };
        self.commands.lock().insert(id, command.clone());
        info!(
            "Command {} ({}) created for station {} by user {}",
            id,
            command_type.as_str(),
            station_id,
            issued_by
        );
        COMMAND_TRANSITIONS_TOTAL
            .with_label_values(&[CommandStatus::Pending.as_str()])
            .inc();
        self.bus.publish(CoreEvent::CommandStatus {
            change: CommandChange::Created,
            command,
        });

        self.deliver(id).await
    }

    /// Applies a station's verdict. Rejected once the command is terminal.
    pub async fn handle_execution_response(
        &self,
        id: CommandId,
        success: bool,
        response: Option<Value>,
    ) -> Result<Command> {
        let _write = self.write_lock(id).await;
        let command = self.transition(id, |command| {
            if command.status.is_terminal() {
                return Err(Error::InvalidOperation(format!(
                    "command {} is already {}",
                    command.id, command.status
                )));
            }
            if success {
                command.status = CommandStatus::Executed;
                command.executed_at = Some(Utc::now());
            } else {
                command.status = CommandStatus::Failed;
            }
            command.response = response;
            command.attempt += 1;
            Ok(())
        })?;

        let change = if success {
            info!("Command {} executed by station {}", id, command.station_id);
            CommandChange::Executed
        } else {
            warn!("Command {} failed on station {}", id, command.station_id);
            CommandChange::Failed
        };
        self.record(change, command.clone()).await;
        Ok(command)
    }

    /// Resolves an inbound `command/response` message. The command is taken
    /// from `commandId` or, failing that, is the station's most recent
    /// outstanding one.
    pub async fn handle_station_message(
        &self,
        station_id: StationId,
        payload: &Payload,
    ) -> Result<Command> {
        let body = payload.as_json().ok_or_else(|| {
            Error::Validation(format!(
                "command response from station {} is not JSON",
                station_id
            ))
        })?;

        let id = match body.get("commandId") {
            Some(value) => value
                .as_i64()
                .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                .ok_or_else(|| Error::Validation(format!("invalid commandId {}", value)))?,
            None => self
                .outstanding(station_id)
                .last()
                .map(|c| c.id)
                .ok_or_else(|| {
                    Error::NotFound(format!("outstanding command for station {}", station_id))
                })?,
        };

        match self.get(id) {
            None => return Err(Error::NotFound(format!("command {}", id))),
            Some(command) if command.station_id != station_id => {
                return Err(Error::InvalidOperation(format!(
                    "command {} does not belong to station {}",
                    id, station_id
                )));
            }
            Some(_) => {}
        }

        let success = body
            .get("success")
            .and_then(Value::as_bool)
            .or_else(|| {
                body.get("status").and_then(Value::as_str).map(|s| {
                    matches!(
                        s.to_ascii_lowercase().as_str(),
                        "executed" | "success" | "ok"
                    )
                })
            })
            .unwrap_or(false);
        let response = body.get("response").cloned().unwrap_or_else(|| body.clone());

        self.handle_execution_response(id, success, Some(response))
            .await
    }

    /// Sends a FAILED or TIMEOUT command again. Any watchdog left from the
    /// earlier attempt becomes stale.
    pub async fn retry(self: &Arc<Self>, id: CommandId) -> Result<Command> {
        let write = self.write_lock(id).await;
        let command = self.transition(id, |command| {
            if !matches!(
                command.status,
                CommandStatus::Failed | CommandStatus::Timeout
            ) {
                return Err(Error::InvalidOperation(format!(
                    "command {} is {}, only FAILED or TIMEOUT commands can be retried",
                    command.id, command.status
                )));
            }
            command.status = CommandStatus::Pending;
            command.sent_at = None;
            command.executed_at = None;
            command.response = None;
            command.attempt += 1;
            Ok(())
        })?;

        info!("Retrying command {} for station {}", id, command.station_id);
        self.record(CommandChange::Retried, command).await;
        drop(write);
        self.deliver(id).await
    }

    /// Gives up on a command that has not finished. The command ends FAILED.
    pub async fn cancel(&self, id: CommandId) -> Result<Command> {
        let _write = self.write_lock(id).await;
        let command = self.transition(id, |command| {
            match command.status {
                CommandStatus::Executed => {
                    return Err(Error::InvalidOperation(format!(
                        "command {} already executed",
                        command.id
                    )))
                }
                CommandStatus::Failed | CommandStatus::Timeout => {
                    return Err(Error::InvalidOperation(format!(
                        "command {} already finished as {}",
                        command.id, command.status
                    )))
                }
                CommandStatus::Pending | CommandStatus::Sent => {}
            }
            command.status = CommandStatus::Failed;
            command.response = Some(json!({ "cancelled": true }));
            command.attempt += 1;
            Ok(())
        })?;

        info!("Command {} cancelled", id);
        self.record(CommandChange::Cancelled, command.clone()).await;
        Ok(command)
    }

    /// Forgets terminal commands created before `before`. Returns how many
    /// were dropped.
    pub fn evict_finished(&self, before: DateTime<Utc>) -> usize {
        let mut commands = self.commands.lock();
        let count = commands.len();
        commands.retain(|_, c| !c.status.is_terminal() || c.created_at >= before);
        let evicted = count - commands.len();
        self.write_locks
            .lock()
            .retain(|id, _| commands.contains_key(id));
        if evicted > 0 {
            debug!("Evicted {} finished command(s)", evicted);
        }
        evicted
    }

    async fn deliver(self: &Arc<Self>, id: CommandId) -> Result<Command> {
        let command = self
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("command {}", id)))?;

        let registry = self.transport.read().clone();
        let Some(registry) = registry else {
            warn!(
                "No transport attached, command {} for station {} stays PENDING",
                id, command.station_id
            );
            return Ok(self.undelivered(command));
        };
        let Some(link) = registry.link(command.station_id).await else {
            warn!(
                "Station {} has no link, command {} stays PENDING",
                command.station_id, id
            );
            return Ok(self.undelivered(command));
        };

        let message = OutboundCommand {
            command_id: id,
            command_type: command.command_type,
            command: &command.payload,
            timestamp: Utc::now(),
            timeout: self.timeout.as_millis() as u64,
        };
        let topic = topic::command_topic(link.serial_code());
        let published = registry
            .publish(
                &topic,
                &message,
                Some(command.station_id),
                PublishOptions::default(),
            )
            .await;

        match published {
            Ok(_) => {
                let write = self.write_lock(id).await;
                let sent = self.transition(id, |command| {
                    if command.status != CommandStatus::Pending {
                        return Err(Error::InvalidOperation(format!(
                            "command {} became {} while being sent",
                            command.id, command.status
                        )));
                    }
                    command.status = CommandStatus::Sent;
                    command.sent_at = Some(Utc::now());
                    command.attempt += 1;
                    Ok(())
                });
                let sent = match sent {
                    Ok(sent) => sent,
                    Err(e) => {
                        debug!("{}", e);
                        return self
                            .get(id)
                            .ok_or_else(|| Error::NotFound(format!("command {}", id)));
                    }
                };

                debug!("Command {} sent on {}", id, topic);
                self.record(CommandChange::Sent, sent.clone()).await;
                drop(write);
                self.arm_watchdog(id, sent.attempt);
                Ok(sent)
            }
            Err(e @ (Error::NotConnected | Error::NotFound(_))) => {
                warn!(
                    "Command {} for station {} stays PENDING: {}",
                    id, command.station_id, e
                );
                Ok(self.undelivered(command))
            }
            Err(e) => {
                if e.is_transport() {
                    warn!("Publishing command {} failed: {}", id, e);
                } else {
                    error!("Could not send command {}: {}", id, e);
                }
                let reason = e.to_string();
                let _write = self.write_lock(id).await;
                let failed = self.transition(id, |command| {
                    if command.status.is_terminal() {
                        return Err(Error::InvalidOperation(format!(
                            "command {} is already {}",
                            command.id, command.status
                        )));
                    }
                    command.status = CommandStatus::Failed;
                    command.response = Some(json!({ "error": reason }));
                    command.attempt += 1;
                    Ok(())
                })?;
                self.record(CommandChange::Failed, failed.clone()).await;
                Ok(failed)
            }
        }
    }

    fn undelivered(&self, command: Command) -> Command {
        self.bus.publish(CoreEvent::CommandStatus {
            change: CommandChange::Undelivered,
            command: command.clone(),
        });
        command
    }

    fn arm_watchdog(self: &Arc<Self>, id: CommandId, attempt: u64) {
        let orchestrator = Arc::downgrade(self);
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(orchestrator) = orchestrator.upgrade() {
                orchestrator.expire(id, attempt).await;
            }
        });
    }

    async fn expire(&self, id: CommandId, attempt: u64) {
        let _write = self.write_lock(id).await;
        let expired = {
            let mut commands = self.commands.lock();
            match commands.get_mut(&id) {
                Some(command) if command.attempt == attempt && !command.status.is_terminal() => {
                    command.status = CommandStatus::Timeout;
                    command.attempt += 1;
                    Some(command.clone())
                }
                _ => None,
            }
        };

        match expired {
            Some(command) => {
                warn!(
                    "Command {} for station {} timed out after {:?}",
                    id, command.station_id, self.timeout
                );
                self.record(CommandChange::TimedOut, command).await;
            }
            None => debug!("Watchdog for command {} attempt {} is stale", id, attempt),
        }
    }

    async fn write_lock(&self, id: CommandId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.write_locks.lock().entry(id).or_default());
        lock.lock_owned().await
    }

    /// Runs `apply` against the command under the lock and returns the
    /// updated copy. `apply` must leave the command untouched when it errors.
    fn transition<F>(&self, id: CommandId, apply: F) -> Result<Command>
    where
        F: FnOnce(&mut Command) -> Result<()>,
    {
        let mut commands = self.commands.lock();
        let command = commands
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("command {}", id)))?;
        apply(command)?;
        Ok(command.clone())
    }

    async fn record(&self, change: CommandChange, command: Command) {
        COMMAND_TRANSITIONS_TOTAL
            .with_label_values(&[command.status.as_str()])
            .inc();
        if let Err(e) = self
            .persistence
            .update_command_status(command.id, &CommandUpdate::from(&command))
            .await
        {
            DB_FAILURES_TOTAL.inc();
            error!(
                "Failed to persist command {} as {}: {}",
                command.id, command.status, e
            );
        }
        self.bus.publish(CoreEvent::CommandStatus { change, command });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkConfig;
    use crate::model::{StationCertificate, StationCredentials, StationRef};
    use crate::persistence::MemoryStore;
    use crate::session::MemoryFactory;
    use tokio::sync::broadcast;
    use tokio::time::sleep;

    const TIMEOUT: Duration = Duration::from_secs(30);

    struct Harness {
        orchestrator: Arc<CommandOrchestrator>,
        store: MemoryStore,
        factory: MemoryFactory,
        events: broadcast::Receiver<CoreEvent>,
    }

    fn credentials(id: StationId) -> StationCredentials {
        let pem = b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n".to_vec();
        StationCredentials::new(
            &StationRef {
                id,
                serial_code: format!("WS-{}", id),
                organization_id: None,
            },
            StationCertificate {
                cert_pem: pem.clone(),
                key_pem: pem.clone(),
                root_ca_pem: pem,
            },
        )
        .unwrap()
    }

    async fn harness(with_transport: bool) -> Harness {
        let store = MemoryStore::new();
        let bus = EventBus::new(128);
        let events = bus.subscribe();
        let orchestrator = Arc::new(CommandOrchestrator::new(
            Arc::new(store.clone()),
            bus,
            TIMEOUT,
        ));
        let factory = MemoryFactory::new();
        if with_transport {
            let registry = Arc::new(LinkRegistry::new(
                Arc::new(factory.clone()),
                LinkConfig::default(),
                64,
            ));
            registry.add_station(credentials(1)).await;
            registry.connect_all().await;
            orchestrator.attach_transport(registry);
        }
        Harness {
            orchestrator,
            store,
            factory,
            events,
        }
    }

    fn changes(rx: &mut broadcast::Receiver<CoreEvent>) -> Vec<CommandChange> {
        let mut changes = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let CoreEvent::CommandStatus { change, .. } = event {
                changes.push(change);
            }
        }
        changes
    }

    fn persisted(store: &MemoryStore, id: CommandId) -> Vec<CommandStatus> {
        store.updates_for(id).iter().map(|u| u.status).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_transport_command_stays_pending() {
        let mut h = harness(false).await;

        let command = h
            .orchestrator
            .create(1, json!({"command": "sync"}), 7)
            .await
            .unwrap();
        sleep(Duration::from_secs(600)).await;

        let command = h.orchestrator.get(command.id).unwrap();
        assert_eq!(command.status, CommandStatus::Pending);
        assert_eq!(command.command_type, CommandType::Sync);
        assert!(command.sent_at.is_none());
        assert_eq!(h.store.commands().len(), 1);
        assert!(persisted(&h.store, command.id).is_empty());
        assert_eq!(
            changes(&mut h.events),
            vec![CommandChange::Created, CommandChange::Undelivered]
        );
    }

    #[tokio::test]
    async fn test_unknown_command_name_fails_creation() {
        let h = harness(true).await;
        let err = h
            .orchestrator
            .create(1, json!({"command": "self-destruct"}), 7)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(h.store.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_message_shape() {
        let h = harness(true).await;

        let command = h
            .orchestrator
            .create(1, json!({"command": "reset", "delay": 5}), 7)
            .await
            .unwrap();

        assert_eq!(command.status, CommandStatus::Sent);
        assert!(command.sent_at.is_some());
        let sent = h.factory.published_to("station/WS-1/command");
        assert_eq!(sent.len(), 1);
        let body = sent[0].json().unwrap();
        assert_eq!(body["commandId"], json!(command.id));
        assert_eq!(body["type"], json!("RESET"));
        assert_eq!(body["command"]["delay"], json!(5));
        assert_eq!(body["timeout"], json!(30_000));
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_exactly_once() {
        let mut h = harness(true).await;
        let command = h
            .orchestrator
            .create(1, json!({"command": "activate"}), 7)
            .await
            .unwrap();

        sleep(TIMEOUT + Duration::from_secs(1)).await;
        assert_eq!(
            h.orchestrator.get(command.id).unwrap().status,
            CommandStatus::Timeout
        );

        sleep(TIMEOUT * 4).await;
        assert_eq!(
            persisted(&h.store, command.id),
            vec![CommandStatus::Sent, CommandStatus::Timeout]
        );
        let timeouts = changes(&mut h.events)
            .into_iter()
            .filter(|c| *c == CommandChange::TimedOut)
            .count();
        assert_eq!(timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_watchdog_ignored_after_retry() {
        let h = harness(true).await;
        let command = h
            .orchestrator
            .create(1, json!({"command": "update"}), 7)
            .await
            .unwrap();

        sleep(Duration::from_secs(10)).await;
        h.orchestrator
            .handle_execution_response(command.id, false, Some(json!({"reason": "busy"})))
            .await
            .unwrap();
        let retried = h.orchestrator.retry(command.id).await.unwrap();
        assert_eq!(retried.status, CommandStatus::Sent);
        assert!(retried.response.is_none());

        // First watchdog would fire at 30s, the new one at 40s.
        sleep(Duration::from_secs(25)).await;
        assert_eq!(
            h.orchestrator.get(command.id).unwrap().status,
            CommandStatus::Sent
        );

        sleep(Duration::from_secs(6)).await;
        assert_eq!(
            h.orchestrator.get(command.id).unwrap().status,
            CommandStatus::Timeout
        );
        assert_eq!(h.factory.published_to("station/WS-1/command").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_rejected_unless_failed_or_timed_out() {
        let h = harness(true).await;
        let command = h
            .orchestrator
            .create(1, json!({"command": "sync"}), 7)
            .await
            .unwrap();

        let err = h.orchestrator.retry(command.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert_eq!(
            h.orchestrator.get(command.id).unwrap().status,
            CommandStatus::Sent
        );

        h.orchestrator
            .handle_execution_response(command.id, true, None)
            .await
            .unwrap();
        assert!(h.orchestrator.retry(command.id).await.is_err());
        assert!(matches!(
            h.orchestrator.retry(999).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_rules() {
        let mut h = harness(true).await;
        let executed = h
            .orchestrator
            .create(1, json!({"command": "reset"}), 7)
            .await
            .unwrap();
        h.orchestrator
            .handle_execution_response(executed.id, true, Some(json!({"ok": true})))
            .await
            .unwrap();

        let err = h.orchestrator.cancel(executed.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        let still = h.orchestrator.get(executed.id).unwrap();
        assert_eq!(still.status, CommandStatus::Executed);
        assert!(still.executed_at.is_some());

        let sent = h
            .orchestrator
            .create(1, json!({"command": "deactivate"}), 7)
            .await
            .unwrap();
        let cancelled = h.orchestrator.cancel(sent.id).await.unwrap();
        assert_eq!(cancelled.status, CommandStatus::Failed);
        assert!(h.orchestrator.cancel(sent.id).await.is_err());

        // The cancelled command's watchdog must not turn it into TIMEOUT.
        sleep(TIMEOUT * 2).await;
        assert_eq!(
            h.orchestrator.get(sent.id).unwrap().status,
            CommandStatus::Failed
        );
        assert!(changes(&mut h.events).contains(&CommandChange::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_station_response_resolves_latest_outstanding() {
        let h = harness(true).await;
        let first = h
            .orchestrator
            .create(1, json!({"command": "sync"}), 7)
            .await
            .unwrap();
        let second = h
            .orchestrator
            .create(1, json!({"command": "reset"}), 7)
            .await
            .unwrap();

        let resolved = h
            .orchestrator
            .handle_station_message(1, &Payload::Json(json!({"success": true})))
            .await
            .unwrap();
        assert_eq!(resolved.id, second.id);
        assert_eq!(resolved.status, CommandStatus::Executed);

        let resolved = h
            .orchestrator
            .handle_station_message(
                1,
                &Payload::Json(json!({
                    "commandId": first.id,
                    "success": false,
                    "response": {"error": "sensor offline"}
                })),
            )
            .await
            .unwrap();
        assert_eq!(resolved.status, CommandStatus::Failed);
        assert_eq!(resolved.response, Some(json!({"error": "sensor offline"})));

        // Late duplicate for a finished command.
        let late = h
            .orchestrator
            .handle_station_message(1, &Payload::Json(json!({"commandId": first.id, "success": true})))
            .await;
        assert!(matches!(late, Err(Error::InvalidOperation(_))));

        let none_left = h
            .orchestrator
            .handle_station_message(1, &Payload::Json(json!({"success": true})))
            .await;
        assert!(matches!(none_left, Err(Error::NotFound(_))));
        assert!(h
            .orchestrator
            .handle_station_message(1, &Payload::Raw("ok".into()))
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_from_other_station_rejected() {
        let h = harness(true).await;
        let command = h
            .orchestrator
            .create(1, json!({"command": "sync"}), 7)
            .await
            .unwrap();
        let err = h
            .orchestrator
            .handle_station_message(
                2,
                &Payload::Json(json!({"commandId": command.id, "success": true})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_marks_failed() {
        let h = harness(true).await;
        h.factory.fail_publishes(1, true);

        let command = h
            .orchestrator
            .create(1, json!({"command": "activate"}), 7)
            .await
            .unwrap();

        assert_eq!(command.status, CommandStatus::Failed);
        assert!(command.response.unwrap()["error"].is_string());
        assert_eq!(persisted(&h.store, command.id), vec![CommandStatus::Failed]);

        h.factory.fail_publishes(1, false);
        let retried = h.orchestrator.retry(command.id).await.unwrap();
        assert_eq!(retried.status, CommandStatus::Sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlinked_station_stays_pending() {
        let h = harness(true).await;
        let command = h
            .orchestrator
            .create(42, json!({"command": "sync"}), 7)
            .await
            .unwrap();
        assert_eq!(command.status, CommandStatus::Pending);

        h.orchestrator.detach_transport();
        assert!(!h.orchestrator.has_transport());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_finished_keeps_outstanding() {
        let h = harness(true).await;
        let done = h
            .orchestrator
            .create(1, json!({"command": "sync"}), 7)
            .await
            .unwrap();
        h.orchestrator
            .handle_execution_response(done.id, true, None)
            .await
            .unwrap();
        let open = h
            .orchestrator
            .create(1, json!({"command": "sync"}), 7)
            .await
            .unwrap();

        let evicted = h
            .orchestrator
            .evict_finished(Utc::now() + chrono::Duration::seconds(1));

        assert_eq!(evicted, 1);
        assert!(h.orchestrator.get(done.id).is_none());
        assert!(h.orchestrator.get(open.id).is_some());
    }

    /// Store whose SENT writes are slow, as under a struggling database.
    struct SlowSentStore {
        inner: MemoryStore,
    }

    #[async_trait::async_trait]
    impl Persistence for SlowSentStore {
        async fn save_telemetry(&self, sample: &crate::model::TelemetrySample) -> Result<()> {
            self.inner.save_telemetry(sample).await
        }

        async fn create_command(&self, command: &NewCommand) -> Result<CommandId> {
            self.inner.create_command(command).await
        }

        async fn update_command_status(&self, id: CommandId, update: &CommandUpdate) -> Result<()> {
            if update.status == CommandStatus::Sent {
                sleep(Duration::from_millis(200)).await;
            }
            self.inner.update_command_status(id, update).await
        }

        async fn get_active_stations(&self) -> Result<Vec<StationRef>> {
            self.inner.get_active_stations().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_persist_in_transition_order() {
        let store = MemoryStore::new();
        let orchestrator = Arc::new(CommandOrchestrator::new(
            Arc::new(SlowSentStore {
                inner: store.clone(),
            }),
            EventBus::new(64),
            TIMEOUT,
        ));
        let factory = MemoryFactory::new();
        let registry = Arc::new(LinkRegistry::new(
            Arc::new(factory.clone()),
            LinkConfig::default(),
            64,
        ));
        registry.add_station(credentials(1)).await;
        registry.connect_all().await;
        orchestrator.attach_transport(registry);

        let creating = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                orchestrator
                    .create(1, json!({"command": "reset"}), 7)
                    .await
            })
        };

        // Wait until the command is SENT in memory while its row is still being written.
        let id = loop {
            sleep(Duration::from_millis(10)).await;
            // The memory store hands out ids from 1.
            let sent = orchestrator
                .get(1)
                .filter(|c| c.status == CommandStatus::Sent);
            if let Some(command) = sent {
                break command.id;
            }
        };
        assert!(persisted(&store, id).is_empty());

        let executed = orchestrator
            .handle_execution_response(id, true, None)
            .await
            .unwrap();
        assert_eq!(executed.status, CommandStatus::Executed);
        creating.await.unwrap().unwrap();

        assert_eq!(
            persisted(&store, id),
            vec![CommandStatus::Sent, CommandStatus::Executed]
        );
        assert_eq!(
            store.updates_for(id).last().map(|u| u.status),
            Some(orchestrator.get(id).unwrap().status)
        );
    }
}
