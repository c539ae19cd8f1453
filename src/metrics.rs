//! Coordinator self-metrics, exposed at `/metrics`. Ported verbatim from the
//! donor webhook server's `LazyLock<Registry>` + `LazyLock<IntCounterVec>`/
//! `LazyLock<Histogram>` pattern, retargeted onto session/request counters
//! instead of admission-webhook counters.

use std::sync::LazyLock;

use prometheus::{Encoder, Histogram, IntCounterVec, IntGauge, Registry, TextEncoder};

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static WS_SESSIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new("kubedoor_ws_sessions", "Currently connected agent sessions").expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

pub static REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("kubedoor_requests_total", "Total coordinator HTTP requests"),
        &["route", "status"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static REQUEST_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "kubedoor_request_duration_seconds",
        "Duration of coordinator HTTP request processing in seconds",
    ))
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

/// Render the registry in Prometheus text-exposition format.
pub fn render() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("metrics encoding error: {e}"))?;
    String::from_utf8(buffer).map_err(|e| format!("metrics encoding error: {e}"))
}
