use anyhow::Context;
use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use station_gateway::config::Config;
use station_gateway::db::PgStore;
use station_gateway::fanout::BroadcastTransport;
use station_gateway::metrics;
use station_gateway::session::RumqttFactory;
use station_gateway::StationCore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();

    info!("Starting station gateway");
    info!("MQTT endpoint: {}:{}", config.mqtt_endpoint, config.mqtt_port);
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.redacted_database_url());

    metrics::init_metrics().context("failed to register metrics")?;

    let store = Arc::new(
        PgStore::connect(&config.database_url)
            .await
            .context("failed to connect to database")?,
    );

    let factory = Arc::new(RumqttFactory {
        endpoint: config.mqtt_endpoint.clone(),
        port: config.mqtt_port,
        keep_alive: config.mqtt_keep_alive,
        reconnect_delay: Duration::from_secs(5),
        channel_capacity: 64,
    });
    // The WebSocket layer subscribes to this transport.
    let transport = Arc::new(BroadcastTransport::new(config.event_capacity));

    let http_addr = config.http_addr.clone();
    let core = Arc::new(StationCore::new(
        config,
        store.clone(),
        store,
        factory,
        transport,
    ));

    let summary = core.initialize().await?;
    info!(
        "{} station(s) connected, {} failed",
        summary.connected.len(),
        summary.failed.len()
    );

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::clone(&core));

    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", http_addr))?;
    info!("HTTP server listening on {}", http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    core.shutdown().await;
    info!("Shut down");
    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

async fn health_handler(State(core): State<Arc<StationCore>>) -> Json<Value> {
    let registry = core.registry();
    Json(json!({
        "status": "ok",
        "stations": registry.len().await,
        "connected": registry.connected_count().await,
    }))
}
