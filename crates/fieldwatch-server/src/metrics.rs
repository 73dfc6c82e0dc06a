//! Metrics collection and export for fieldwatch.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use fieldwatch_core::{FanoutReport, HubStats};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "fieldwatch_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "fieldwatch_connections_active";
    pub const MESSAGES_TOTAL: &str = "fieldwatch_messages_total";
    pub const MESSAGES_BYTES: &str = "fieldwatch_messages_bytes";
    pub const EVENTS_TOTAL: &str = "fieldwatch_events_total";
    pub const EVENTS_DROPPED_TOTAL: &str = "fieldwatch_events_dropped_total";
    pub const DELIVERIES_TOTAL: &str = "fieldwatch_deliveries_total";
    pub const DELIVERIES_DROPPED_TOTAL: &str = "fieldwatch_deliveries_dropped_total";
    pub const SESSIONS_ACTIVE: &str = "fieldwatch_sessions_active";
    pub const PROJECTS_ACTIVE: &str = "fieldwatch_projects_active";
    pub const LATENCY_SECONDS: &str = "fieldwatch_latency_seconds";
    pub const ERRORS_TOTAL: &str = "fieldwatch_errors_total";
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
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames processed");
    metrics::describe_counter!(names::EVENTS_TOTAL, "Client events handled, by kind");
    metrics::describe_counter!(
        names::EVENTS_DROPPED_TOTAL,
        "Client events dropped as malformed or not allowed"
    );
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Server events queued for a connection"
    );
    metrics::describe_counter!(
        names::DELIVERIES_DROPPED_TOTAL,
        "Server events dropped because a connection's queue was full or closed"
    );
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of enumerator sessions");
    metrics::describe_gauge!(names::PROJECTS_ACTIVE, "Current number of projects with members");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Event handling latency in seconds"
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

/// Record a frame.
pub fn record_message(bytes: usize, direction: &str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction.to_string()).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction.to_string()).increment(bytes as u64);
}

/// Record a handled client event.
pub fn record_event(kind: &'static str) {
    counter!(names::EVENTS_TOTAL, "kind" => kind).increment(1);
}

/// Record a dropped client event.
pub fn record_dropped_event(reason: &'static str) {
    counter!(names::EVENTS_DROPPED_TOTAL, "reason" => reason).increment(1);
}

/// Record the outcome of a fan-out.
pub fn record_fanout(report: &FanoutReport) {
    counter!(names::DELIVERIES_TOTAL).increment(report.delivered as u64);
    if report.dropped > 0 {
        counter!(names::DELIVERIES_DROPPED_TOTAL).increment(report.dropped as u64);
    }
}

/// Record event handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Update hub gauges.
pub fn set_hub_stats(stats: &HubStats) {
    gauge!(names::SESSIONS_ACTIVE).set(stats.session_count as f64);
    gauge!(names::PROJECTS_ACTIVE).set(stats.project_count as f64);
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
        // No recorder is installed; recording must still be a no-op.
        let _guard = ConnectionMetricsGuard::new();
        record_fanout(&FanoutReport {
            delivered: 2,
            dropped: 1,
        });
        record_dropped_event("malformed");
    }
}
