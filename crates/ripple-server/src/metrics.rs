//! Metrics collection and export for the Ripple gateway.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "ripple_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "ripple_connections_active";
    pub const EVENTS_TOTAL: &str = "ripple_events_total";
    pub const EVENTS_BYTES: &str = "ripple_events_bytes";
    pub const TOPICS_ACTIVE: &str = "ripple_topics_active";
    pub const OFFLINE_ENQUEUED_TOTAL: &str = "ripple_offline_enqueued_total";
    pub const OFFLINE_DRAINED_TOTAL: &str = "ripple_offline_drained_total";
    pub const CALLS_ACTIVE: &str = "ripple_calls_active";
    pub const CALLS_TOTAL: &str = "ripple_calls_total";
    pub const LATENCY_SECONDS: &str = "ripple_latency_seconds";
    pub const ERRORS_TOTAL: &str = "ripple_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Total number of events processed");
    metrics::describe_counter!(names::EVENTS_BYTES, "Total bytes of events processed");
    metrics::describe_gauge!(names::TOPICS_ACTIVE, "Current number of active topics");
    metrics::describe_counter!(
        names::OFFLINE_ENQUEUED_TOTAL,
        "Total messages queued for offline delivery"
    );
    metrics::describe_counter!(
        names::OFFLINE_DRAINED_TOTAL,
        "Total messages flushed from offline queues"
    );
    metrics::describe_gauge!(names::CALLS_ACTIVE, "Current number of active call sessions");
    metrics::describe_counter!(names::CALLS_TOTAL, "Total call sessions initiated");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Event processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record an event.
pub fn record_event(bytes: usize, direction: &str) {
    counter!(names::EVENTS_TOTAL, "direction" => direction.to_string()).increment(1);
    counter!(names::EVENTS_BYTES, "direction" => direction.to_string()).increment(bytes as u64);
}

/// Record event processing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Update active topic count.
pub fn set_active_topics(count: usize) {
    gauge!(names::TOPICS_ACTIVE).set(count as f64);
}

/// Record messages queued for offline delivery.
pub fn record_offline_enqueued(count: usize) {
    counter!(names::OFFLINE_ENQUEUED_TOTAL).increment(count as u64);
}

/// Record messages flushed from an offline queue.
pub fn record_offline_drained(count: usize) {
    counter!(names::OFFLINE_DRAINED_TOTAL).increment(count as u64);
}

/// Record a call initiation.
pub fn record_call_started() {
    counter!(names::CALLS_TOTAL).increment(1);
}

/// Update active call count.
pub fn set_active_calls(count: usize) {
    gauge!(names::CALLS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // Just test that it doesn't panic
        let _guard = ConnectionMetricsGuard::new();
    }
}
