use anyhow::anyhow;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Instant;

use crate::error::{AppError, Result};

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Metrics collector for the request pipeline and the outbox.
///
/// Without an installed recorder every call is a no-op, so library code can
/// record unconditionally.
#[derive(Debug, Clone, Default)]
pub struct Metrics;

impl Metrics {
    pub fn new() -> Self {
        Self
    }

    /// `outcome` is one of fresh, replayed, in_progress, key_reused, unkeyed, failed.
    pub fn record_idempotency_outcome(&self, operation: &str, outcome: &str) {
        counter!("newsletter_idempotent_requests_total", "operation" => operation.to_string(), "outcome" => outcome.to_string()).increment(1);
    }

    pub fn record_request_latency(&self, operation: &str, duration_ms: f64) {
        histogram!("newsletter_request_duration_ms", "operation" => operation.to_string()).record(duration_ms);
    }

    pub fn record_task_enqueued(&self, kind: &str) {
        counter!("newsletter_outbox_enqueued_total", "kind" => kind.to_string()).increment(1);
    }

    pub fn record_task_dispatched(&self, kind: &str, success: bool) {
        counter!("newsletter_outbox_dispatch_total", "kind" => kind.to_string(), "success" => success.to_string()).increment(1);
    }

    pub fn record_task_exhausted(&self, kind: &str) {
        counter!("newsletter_outbox_exhausted_total", "kind" => kind.to_string()).increment(1);
    }

    pub fn record_send_latency(&self, duration_ms: f64) {
        histogram!("newsletter_outbox_send_duration_ms").record(duration_ms);
    }

    pub fn record_tasks_purged(&self, count: u64) {
        counter!("newsletter_outbox_purged_total").increment(count);
    }

    pub fn set_pending_tasks(&self, count: i64) {
        gauge!("newsletter_outbox_pending_tasks").set(count as f64);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder and its scrape listener on `port`.
///
/// Must be called from within a tokio runtime. Later calls are no-ops.
pub fn init_metrics(port: u16) -> Result<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
        .install()
        .map_err(|e| AppError::Internal(anyhow!("failed to install Prometheus exporter: {}", e)))?;
    describe_metrics();

    METRICS.get_or_init(Metrics::new);
    INSTALLED.get_or_init(|| ());
    Ok(())
}

fn describe_metrics() {
    describe_counter!("newsletter_idempotent_requests_total", Unit::Count, "Requests through the coordinator by outcome");
    describe_histogram!("newsletter_request_duration_ms", Unit::Milliseconds, "Coordinated request latency in milliseconds");

    describe_counter!("newsletter_outbox_enqueued_total", Unit::Count, "Outbox tasks written");
    describe_counter!("newsletter_outbox_dispatch_total", Unit::Count, "Outbox delivery attempts");
    describe_counter!("newsletter_outbox_exhausted_total", Unit::Count, "Outbox tasks that ran out of attempts");
    describe_histogram!("newsletter_outbox_send_duration_ms", Unit::Milliseconds, "Email send latency in milliseconds");
    describe_counter!("newsletter_outbox_purged_total", Unit::Count, "Delivered tasks removed by retention");
    describe_gauge!("newsletter_outbox_pending_tasks", Unit::Count, "Tasks waiting for delivery");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
