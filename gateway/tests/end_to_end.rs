use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use uuid::Uuid;

use station_gateway::config::Config;
use station_gateway::events::{CommandChange, CoreEvent};
use station_gateway::fanout::{BroadcastTransport, Outbound};
use station_gateway::model::{
    CommandStatus, LivenessStatus, StationCertificate, StationRef,
};
use station_gateway::persistence::MemoryStore;
use station_gateway::session::MemoryFactory;
use station_gateway::StationCore;

const STATION: i64 = 1;
const SERIAL: &str = "S1-serial";

fn pem(label: &str) -> Vec<u8> {
    format!("-----BEGIN {}-----\nAAAA\n-----END {}-----\n", label, label).into_bytes()
}

struct Fixture {
    core: StationCore,
    factory: MemoryFactory,
    store: MemoryStore,
    outbound: broadcast::Receiver<Outbound>,
}

async fn start() -> Fixture {
    let store = MemoryStore::new();
    store.add_station(
        StationRef {
            id: STATION,
            serial_code: SERIAL.to_string(),
            organization_id: Some(3),
        },
        Some(StationCertificate {
            cert_pem: pem("CERTIFICATE"),
            key_pem: pem("PRIVATE KEY"),
            root_ca_pem: pem("CERTIFICATE"),
        }),
    );
    let factory = MemoryFactory::new();
    let transport = BroadcastTransport::new(256);
    let outbound = transport.subscribe();

    let config = Config {
        // Keep samples in the buffer for the duration of a test.
        flush_interval: Duration::from_secs(3600),
        ..Config::default()
    };
    let core = StationCore::new(
        config,
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(factory.clone()),
        Arc::new(transport),
    );

    Fixture {
        core,
        factory,
        store,
        outbound,
    }
}

async fn next_outbound(rx: &mut broadcast::Receiver<Outbound>, event: &str) -> Outbound {
    timeout(Duration::from_secs(5), async {
        loop {
            let message = rx.recv().await.expect("transport closed");
            if message.event == event {
                return message;
            }
        }
    })
    .await
    .expect("no realtime delivery in time")
}

#[tokio::test]
async fn test_telemetry_reaches_realtime_subscribers() {
    let mut f = start().await;

    let summary = f.core.initialize().await.unwrap();
    assert_eq!(summary.connected, vec![STATION]);
    assert!(f.factory.subscriptions(STATION).contains(&"devices/1/data".to_string()));

    let watcher = Uuid::new_v4();
    f.core.fanout().join_station(watcher, STATION);

    assert!(f
        .factory
        .inject(STATION, "devices/1/data", r#"{"temperature":25,"humidity":60}"#));

    let delivered = next_outbound(&mut f.outbound, "telemetry").await;
    assert_eq!(delivered.subscriber, watcher);
    assert_eq!(delivered.payload["stationId"], json!(STATION));
    assert_eq!(delivered.payload["temperature"], json!(25.0));
    assert_eq!(delivered.payload["humidity"], json!(60.0));

    assert_eq!(f.core.ingestor().buffered(STATION), 1);
    assert_eq!(
        f.core.ingestor().liveness(STATION).map(|l| l.status),
        Some(LivenessStatus::Online)
    );

    // Shutdown flushes what is still buffered.
    f.core.shutdown().await;
    assert_eq!(f.store.telemetry().len(), 1);
    assert!(!f.factory.is_open(STATION));
}

#[tokio::test]
async fn test_command_round_trip() {
    let f = start().await;
    f.core.initialize().await.unwrap();
    let mut events = f.core.bus().subscribe();

    let command = f
        .core
        .orchestrator()
        .create(STATION, json!({"command": "reset"}), 99)
        .await
        .unwrap();
    assert_eq!(command.status, CommandStatus::Sent);
    assert!(command.sent_at.is_some());

    let sent = f.factory.published_to("station/S1-serial/command");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].json().unwrap()["commandId"], json!(command.id));

    assert!(f.factory.inject(
        STATION,
        "station/S1-serial/command/response",
        r#"{"success":true}"#
    ));

    let executed = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(CoreEvent::CommandStatus {
                change: CommandChange::Executed,
                command,
            }) = events.recv().await
            {
                return command;
            }
        }
    })
    .await
    .expect("command never executed");

    assert_eq!(executed.id, command.id);
    assert_eq!(executed.status, CommandStatus::Executed);
    assert!(executed.executed_at.is_some());

    let stored = f.core.orchestrator().get(command.id).unwrap();
    assert_eq!(stored.status, CommandStatus::Executed);
    let persisted: Vec<CommandStatus> = f
        .store
        .updates_for(command.id)
        .iter()
        .map(|u| u.status)
        .collect();
    assert_eq!(persisted, vec![CommandStatus::Sent, CommandStatus::Executed]);

    f.core.shutdown().await;
}

#[tokio::test]
async fn test_issuer_sees_command_events() {
    let mut f = start().await;
    f.core.initialize().await.unwrap();
    let operator = Uuid::new_v4();
    f.core.fanout().join_user(operator, 99);

    f.core
        .orchestrator()
        .create(STATION, json!({"command": "sync"}), 99)
        .await
        .unwrap();

    let delivered = next_outbound(&mut f.outbound, "command_sent").await;
    assert_eq!(delivered.subscriber, operator);
    assert_eq!(delivered.payload["status"], json!("SENT"));

    f.core.shutdown().await;
}
