mod telemetry;

use anyhow::Context;
use clap::Parser;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use telemetry::WeatherModel;
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Simulates a fleet of weather stations: each one publishes readings and
/// answers the commands the gateway sends it.
#[derive(Parser, Debug)]
#[command(name = "station-simulator")]
struct Args {
    #[arg(long, env = "MQTT_ENDPOINT", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Number of stations to simulate.
    #[arg(long, default_value_t = 10)]
    stations: usize,

    #[arg(long, default_value_t = 1)]
    first_id: i64,

    #[arg(long, default_value = "WS-")]
    serial_prefix: String,

    /// Delay between two readings of the same station.
    #[arg(long, default_value_t = 5000)]
    interval_ms: u64,

    /// Share of readings carrying an out-of-range temperature.
    #[arg(long, default_value_t = 0.02)]
    outlier_rate: f64,

    /// Share of commands answered with `success: false`.
    #[arg(long, default_value_t = 0.1)]
    failure_rate: f64,

    /// Root CA. Together with --cert and --key switches to mutual TLS;
    /// every simulated station then shares that one client certificate.
    #[arg(long, requires_all = ["cert", "key"])]
    ca: Option<PathBuf>,

    #[arg(long)]
    cert: Option<PathBuf>,

    #[arg(long)]
    key: Option<PathBuf>,
}

#[derive(Clone)]
struct Tls {
    ca: Vec<u8>,
    cert: Vec<u8>,
    key: Vec<u8>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Arc::new(Args::parse());

    let tls = match (&args.ca, &args.cert, &args.key) {
        (Some(ca), Some(cert), Some(key)) => Some(Tls {
            ca: std::fs::read(ca).with_context(|| format!("reading {}", ca.display()))?,
            cert: std::fs::read(cert).with_context(|| format!("reading {}", cert.display()))?,
            key: std::fs::read(key).with_context(|| format!("reading {}", key.display()))?,
        }),
        _ => None,
    };

    info!("Starting station simulator");
    info!(
        "Broker: {}:{} ({}), stations: {}, interval: {}ms",
        args.broker,
        args.port,
        if tls.is_some() { "TLS" } else { "plain" },
        args.stations,
        args.interval_ms
    );

    let mut stations = JoinSet::new();
    for offset in 0..args.stations {
        let station_id = args.first_id + offset as i64;
        let args = Arc::clone(&args);
        let tls = tls.clone();
        stations.spawn(async move {
            if let Err(e) = run_station(station_id, args, tls).await {
                error!("Station {} stopped: {}", station_id, e);
            }
        });
    }

    tokio::select! {
        _ = async { while stations.join_next().await.is_some() {} } => {
            warn!("All simulated stations stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }
    Ok(())
}

async fn run_station(station_id: i64, args: Arc<Args>, tls: Option<Tls>) -> anyhow::Result<()> {
    let serial = format!("{}{}", args.serial_prefix, station_id);
    let data_topic = format!("devices/{}/data", station_id);
    let command_topic = format!("station/{}/command", serial);
    let response_topic = format!("station/{}/command/response", serial);

    let mut options = MqttOptions::new(device_client_id(&serial), &args.broker, args.port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(true);
    if let Some(tls) = tls {
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
            ca: tls.ca,
            alpn: None,
            client_auth: Some((tls.cert, tls.key)),
        }));
    }

    let (client, mut eventloop) = AsyncClient::new(options, 64);
    let mut rng = StdRng::from_entropy();
    let mut model = WeatherModel::new(&mut rng, args.outlier_rate);
    let mut ticker = interval(Duration::from_millis(args.interval_ms.max(1)));
    let mut published = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reading = model.next(&mut rng);
                let payload = serde_json::to_vec(&reading)?;
                match client.publish(&data_topic, QoS::AtMostOnce, false, payload).await {
                    Ok(()) => {
                        published += 1;
                        if published % 100 == 0 {
                            info!("Station {} published {} readings", serial, published);
                        }
                    }
                    Err(e) => warn!("Station {} failed to publish: {}", serial, e),
                }
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Station {} connected", serial);
                    // Clean session: subscribe again on every connect.
                    client.subscribe(&command_topic, QoS::AtLeastOnce).await?;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == command_topic => {
                    let answer = answer_command(&publish.payload, args.failure_rate, &mut rng);
                    debug!("Station {} answering command: {}", serial, answer);
                    let body = serde_json::to_vec(&answer)?;
                    if let Err(e) = client.publish(&response_topic, QoS::AtLeastOnce, false, body).await {
                        warn!("Station {} failed to answer command: {}", serial, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Station {} connection error: {}", serial, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
        }
    }
}

/// The gateway connects as `station-{serial}`; a broker drops one of two
/// clients sharing an id, so the device side uses its own prefix.
fn device_client_id(serial: &str) -> String {
    format!("device-{}", serial)
}

fn answer_command(payload: &[u8], failure_rate: f64, rng: &mut impl Rng) -> Value {
    let command: Value = serde_json::from_slice(payload).unwrap_or(Value::Null);
    let command_id = command.get("commandId").cloned().unwrap_or(Value::Null);
    let kind = command
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN");

    if rng.gen_bool(failure_rate.clamp(0.0, 1.0)) {
        json!({
            "commandId": command_id,
            "success": false,
            "response": { "error": format!("{} rejected by station", kind) },
        })
    } else {
        json!({
            "commandId": command_id,
            "success": true,
            "response": { "executed": kind },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_echoes_command_id() {
        let mut rng = StdRng::seed_from_u64(7);
        let answer = answer_command(br#"{"commandId": 12, "type": "RESET"}"#, 0.0, &mut rng);
        assert_eq!(answer["commandId"], json!(12));
        assert_eq!(answer["success"], json!(true));
        assert_eq!(answer["response"]["executed"], json!("RESET"));
    }

    #[test]
    fn test_device_client_id_differs_from_gateway_link() {
        assert_eq!(device_client_id("WS-1"), "device-WS-1");
        assert_ne!(device_client_id("WS-1"), format!("station-{}", "WS-1"));
    }

    #[test]
    fn test_answer_can_fail() {
        let mut rng = StdRng::seed_from_u64(7);
        let answer = answer_command(br#"{"commandId": 3, "type": "SYNC"}"#, 1.0, &mut rng);
        assert_eq!(answer["success"], json!(false));
    }
}
