// Prometheus metrics for the arena server.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Registered participant connections.
    pub static ref LIVE_CONNECTIONS: IntGauge =
        IntGauge::new("codearena_live_connections", "Registered participant connections").unwrap();

    /// Currently running matches (0 or 1).
    pub static ref ACTIVE_MATCHES: IntGauge =
        IntGauge::new("codearena_active_matches", "Currently running matches").unwrap();

    /// Live spectator WebSocket connections.
    pub static ref CONNECTED_WEBSOCKETS: IntGauge =
        IntGauge::new("codearena_connected_websockets", "Live WebSocket connections").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    pub static ref CONNECTIONS_ACCEPTED_TOTAL: IntCounter = IntCounter::new(
        "codearena_connections_accepted_total",
        "Participant connections that completed the handshake",
    )
    .unwrap();

    /// Rejected handshakes, by reason (duplicate_name, malformed).
    pub static ref CONNECTIONS_REJECTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("codearena_connections_rejected_total", "Rejected participant handshakes"),
        &["reason"],
    )
    .unwrap();

    pub static ref SUBMISSIONS_TOTAL: IntCounter = IntCounter::new(
        "codearena_submissions_total",
        "Program uploads received",
    )
    .unwrap();

    /// Submissions excluded at load time, by loader error kind.
    pub static ref LOAD_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("codearena_load_failures_total", "Submissions that failed to load"),
        &["kind"],
    )
    .unwrap();

    /// Decision calls that failed, by kind (script, panic).
    pub static ref AGENT_FAULTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("codearena_agent_faults_total", "Failed agent decisions"),
        &["kind"],
    )
    .unwrap();

    pub static ref CYCLES_TOTAL: IntCounter =
        IntCounter::new("codearena_cycles_total", "Update cycles run").unwrap();

    pub static ref ELIMINATIONS_TOTAL: IntCounter =
        IntCounter::new("codearena_eliminations_total", "Agents eliminated").unwrap();

    pub static ref MATCHES_STARTED_TOTAL: IntCounter =
        IntCounter::new("codearena_matches_started_total", "Total matches started").unwrap();

    pub static ref MATCHES_COMPLETED_TOTAL: IntCounter =
        IntCounter::new("codearena_matches_completed_total", "Total matches completed").unwrap();

    pub static ref MATCHES_ERRORED_TOTAL: IntCounter =
        IntCounter::new("codearena_matches_errored_total", "Total matches that errored").unwrap();

    /// Total API requests, by method/endpoint/status.
    pub static ref API_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("codearena_api_requests_total", "Total API requests"),
        &["method", "endpoint", "status"],
    )
    .unwrap();

    pub static ref WEBSOCKET_MESSAGES_SENT_TOTAL: IntCounter = IntCounter::new(
        "codearena_websocket_messages_sent_total",
        "Total WebSocket messages sent",
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// Per-cycle processing time in milliseconds.
    pub static ref CYCLE_DURATION_MS: Histogram = Histogram::with_opts(
        HistogramOpts::new("codearena_cycle_duration_ms", "Per-cycle processing time in ms")
            .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0]),
    )
    .unwrap();

    pub static ref MATCH_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("codearena_match_duration_seconds", "Match duration in seconds")
            .buckets(vec![10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 900.0, 1200.0]),
    )
    .unwrap();
}

/// Register all metrics with the custom registry. Call once at startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(LIVE_CONNECTIONS.clone()),
        Box::new(ACTIVE_MATCHES.clone()),
        Box::new(CONNECTED_WEBSOCKETS.clone()),
        Box::new(CONNECTIONS_ACCEPTED_TOTAL.clone()),
        Box::new(CONNECTIONS_REJECTED_TOTAL.clone()),
        Box::new(SUBMISSIONS_TOTAL.clone()),
        Box::new(LOAD_FAILURES_TOTAL.clone()),
        Box::new(AGENT_FAULTS_TOTAL.clone()),
        Box::new(CYCLES_TOTAL.clone()),
        Box::new(ELIMINATIONS_TOTAL.clone()),
        Box::new(MATCHES_STARTED_TOTAL.clone()),
        Box::new(MATCHES_COMPLETED_TOTAL.clone()),
        Box::new(MATCHES_ERRORED_TOTAL.clone()),
        Box::new(API_REQUESTS_TOTAL.clone()),
        Box::new(WEBSOCKET_MESSAGES_SENT_TOTAL.clone()),
        Box::new(CYCLE_DURATION_MS.clone()),
        Box::new(MATCH_DURATION_SECONDS.clone()),
    ];

    for c in collectors {
        if let Err(e) = REGISTRY.register(c) {
            tracing::warn!("Metric registration skipped: {e}");
        }
    }
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {e}");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
