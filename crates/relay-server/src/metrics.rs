//! Metrics collection and export for the relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SOCKETS_TOTAL: &str = "relay_sockets_total";
    pub const SOCKETS_ACTIVE: &str = "relay_sockets_active";
    pub const EVENTS_TOTAL: &str = "relay_events_total";
    pub const EVENTS_DELIVERED: &str = "relay_events_delivered_total";
    pub const CONFIG_UPDATES_TOTAL: &str = "relay_config_updates_total";
    pub const TENANTS_ACTIVE: &str = "relay_tenants_active";
    pub const LATENCY_SECONDS: &str = "relay_request_latency_seconds";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::SOCKETS_TOTAL,
        "Total number of admitted sockets since server start"
    );
    metrics::describe_gauge!(names::SOCKETS_ACTIVE, "Current number of open sockets");
    metrics::describe_counter!(names::EVENTS_TOTAL, "Total number of events routed");
    metrics::describe_counter!(
        names::EVENTS_DELIVERED,
        "Total number of socket deliveries"
    );
    metrics::describe_counter!(
        names::CONFIG_UPDATES_TOTAL,
        "Broker config updates by outcome"
    );
    metrics::describe_gauge!(
        names::TENANTS_ACTIVE,
        "Current number of tenants with open sockets"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Event submission latency in seconds"
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

/// Record an admitted socket.
pub fn record_socket_open() {
    counter!(names::SOCKETS_TOTAL).increment(1);
    gauge!(names::SOCKETS_ACTIVE).increment(1.0);
}

/// Record a closed socket.
pub fn record_socket_closed() {
    gauge!(names::SOCKETS_ACTIVE).decrement(1.0);
}

/// Record a routed event and how many sockets got it.
pub fn record_event(source: &'static str, delivered: usize) {
    counter!(names::EVENTS_TOTAL, "source" => source).increment(1);
    counter!(names::EVENTS_DELIVERED, "source" => source).increment(delivered as u64);
}

/// Record a broker config update.
pub fn record_config_update(outcome: &'static str) {
    counter!(names::CONFIG_UPDATES_TOTAL, "outcome" => outcome).increment(1);
}

/// Update the active tenant count.
pub fn set_active_tenants(count: usize) {
    gauge!(names::TENANTS_ACTIVE).set(count as f64);
}

/// Record submission latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records the socket closing on drop.
pub struct SocketMetricsGuard;

impl SocketMetricsGuard {
    /// Create a new metrics guard, recording an admitted socket.
    #[must_use]
    pub fn new() -> Self {
        record_socket_open();
        Self
    }
}

impl Default for SocketMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SocketMetricsGuard {
    fn drop(&mut self) {
        record_socket_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // No recorder installed; must not panic
        let _guard = SocketMetricsGuard::new();
        record_event("http", 2);
        record_config_update("connected");
    }
}
