use std::sync::atomic::{AtomicU64, Ordering};

/// Process counters exposed at `/metrics` in Prometheus text format.
///
/// The surface is small enough that the exposition format is rendered
/// by hand; gauges sampled at scrape time come in through
/// [`Metrics::render`]'s arguments.
#[derive(Debug, Default)]
pub struct Metrics {
    pub http_requests: AtomicU64,
    pub http_errors: AtomicU64,
    pub ws_connections_total: AtomicU64,
    pub function_invocations: AtomicU64,
    pub function_timeouts: AtomicU64,
}

/// Point-in-time gauges sampled by the scrape handler.
#[derive(Debug, Default, Clone, Copy)]
pub struct GaugeSample {
    pub event_seq: u64,
    pub active_connections: usize,
    pub active_subscriptions: usize,
    pub deltas_delivered: u64,
    pub stale_subscriptions: u64,
    pub pool_ready: usize,
    pub pool_busy: usize,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Renders the exposition text.
    pub fn render(&self, gauges: GaugeSample) -> String {
        let mut out = String::with_capacity(1024);
        counter(
            &mut out,
            "alyx_http_requests_total",
            "HTTP requests handled",
            self.http_requests.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "alyx_http_errors_total",
            "HTTP requests answered with an error status",
            self.http_errors.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "alyx_ws_connections_total",
            "WebSocket connections accepted",
            self.ws_connections_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "alyx_function_invocations_total",
            "Function invocations dispatched",
            self.function_invocations.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "alyx_function_timeouts_total",
            "Function invocations killed on deadline",
            self.function_timeouts.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "alyx_change_seq",
            "Last assigned change sequence number",
            gauges.event_seq,
        );
        gauge(
            &mut out,
            "alyx_realtime_connections",
            "Open realtime connections",
            gauges.active_connections as u64,
        );
        gauge(
            &mut out,
            "alyx_realtime_subscriptions",
            "Active subscriptions",
            gauges.active_subscriptions as u64,
        );
        counter(
            &mut out,
            "alyx_realtime_deltas_total",
            "Deltas enqueued for delivery",
            gauges.deltas_delivered,
        );
        counter(
            &mut out,
            "alyx_realtime_stale_total",
            "Subscriptions dropped for queue overflow",
            gauges.stale_subscriptions,
        );
        gauge(
            &mut out,
            "alyx_pool_ready_workers",
            "Warm function workers ready",
            gauges.pool_ready as u64,
        );
        gauge(
            &mut out,
            "alyx_pool_busy_workers",
            "Function workers mid-invocation",
            gauges.pool_busy as u64,
        );
        out
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    out.push_str(&format!(
        "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
    ));
}

fn gauge(out: &mut String, name: &str, help: &str, value: u64) {
    out.push_str(&format!(
        "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"
    ));
}
