// Prometheus metrics definitions for the statebridge backend.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Sessions with a slot in the cache.
    pub static ref ACTIVE_SESSIONS: IntGauge =
        IntGauge::new("statebridge_active_sessions", "Sessions held in the cache").unwrap();

    /// Live WebSocket connections.
    pub static ref CONNECTED_WEBSOCKETS: IntGauge =
        IntGauge::new("statebridge_connected_websockets", "Live WebSocket connections").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Successful reconciliations, by mode (full, delta).
    pub static ref RECONCILIATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("statebridge_reconciliations_total", "Successful reconciliations"),
        &["mode"],
    )
    .unwrap();

    /// Rejected updates, by error kind.
    pub static ref RECONCILE_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("statebridge_reconcile_errors_total", "Rejected context updates"),
        &["kind"],
    )
    .unwrap();

    /// Interactions dropped because their target was not in view.
    pub static ref DANGLING_INTERACTIONS_DROPPED_TOTAL: IntCounter = IntCounter::new(
        "statebridge_dangling_interactions_dropped_total",
        "Interactions dropped for dangling targets",
    )
    .unwrap();

    /// Failed inference calls, by reason.
    pub static ref INFERENCE_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("statebridge_inference_failures_total", "Failed inference calls"),
        &["reason"],
    )
    .unwrap();

    /// Total API requests, by method/endpoint/status.
    pub static ref API_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("statebridge_api_requests_total", "Total API requests"),
        &["method", "endpoint", "status"],
    )
    .unwrap();

    /// Total WebSocket messages sent to clients.
    pub static ref WEBSOCKET_MESSAGES_SENT_TOTAL: IntCounter = IntCounter::new(
        "statebridge_websocket_messages_sent_total",
        "Total WebSocket messages sent",
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// Inference call duration in seconds, by provider.
    pub static ref INFERENCE_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "statebridge_inference_duration_seconds",
            "Inference call duration in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["provider"],
    )
    .unwrap();

    /// API request duration in seconds, by endpoint.
    pub static ref API_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "statebridge_api_request_duration_seconds",
            "API request duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        &["endpoint"],
    )
    .unwrap();
}

/// Register all metrics with the custom registry. Call once at startup.
/// Registering twice is harmless: duplicates are ignored.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ACTIVE_SESSIONS.clone()),
        Box::new(CONNECTED_WEBSOCKETS.clone()),
        Box::new(RECONCILIATIONS_TOTAL.clone()),
        Box::new(RECONCILE_ERRORS_TOTAL.clone()),
        Box::new(DANGLING_INTERACTIONS_DROPPED_TOTAL.clone()),
        Box::new(INFERENCE_FAILURES_TOTAL.clone()),
        Box::new(API_REQUESTS_TOTAL.clone()),
        Box::new(WEBSOCKET_MESSAGES_SENT_TOTAL.clone()),
        Box::new(INFERENCE_DURATION_SECONDS.clone()),
        Box::new(API_REQUEST_DURATION_SECONDS.clone()),
    ];

    for c in collectors {
        match REGISTRY.register(c) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => tracing::error!("Failed to register metric: {e}"),
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
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Normalize a URL path for metric labels: the segment after `sessions` is a
/// client-chosen id and is replaced with `:id` to bound cardinality.
pub fn normalize_path(path: &str) -> String {
    let mut previous = "";
    path.split('/')
        .map(|segment| {
            let normalized = if previous == "sessions" && !segment.is_empty() {
                ":id"
            } else {
                segment
            };
            previous = segment;
            normalized
        })
        .collect::<Vec<_>>()
        .join("/")
}
