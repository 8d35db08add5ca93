use lazy_static::lazy_static;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder,
};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_messages_total",
        "Total messages received from station links"
    ))
    .unwrap();
    pub static ref DEGRADED_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_degraded_messages_total",
        "Messages whose payload was not valid JSON"
    ))
    .unwrap();
    pub static ref TELEMETRY_SAMPLES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_telemetry_samples_total",
        "Telemetry samples accepted into the buffer"
    ))
    .unwrap();
    pub static ref INVALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_invalid_messages_total",
        "Inbound messages that could not be routed or parsed"
    ))
    .unwrap();
    pub static ref THRESHOLD_ALERTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_threshold_alerts_total",
        "Telemetry fields outside their static range"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_db_failures_total",
        "Total persistence failures"
    ))
    .unwrap();
    pub static ref FLUSH_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "gateway_flush_latency_seconds",
            "Time taken to persist one flush cycle"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref BUFFERED_SAMPLES: Gauge = Gauge::with_opts(Opts::new(
        "gateway_buffered_samples",
        "Samples waiting for the next flush"
    ))
    .unwrap();
    pub static ref CONNECTED_STATIONS: Gauge = Gauge::with_opts(Opts::new(
        "gateway_connected_stations",
        "Station links currently connected"
    ))
    .unwrap();
    pub static ref COMMAND_TRANSITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "gateway_command_transitions_total",
            "Command status transitions by resulting status"
        ),
        &["status"]
    )
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DEGRADED_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TELEMETRY_SAMPLES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INVALID_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(THRESHOLD_ALERTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(FLUSH_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(BUFFERED_SAMPLES.clone()))?;
    REGISTRY.register(Box::new(CONNECTED_STATIONS.clone()))?;
    REGISTRY.register(Box::new(COMMAND_TRANSITIONS_TOTAL.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
