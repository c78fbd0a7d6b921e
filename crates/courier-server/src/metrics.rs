//! Metrics collection and export for Courier.
//!
//! Uses the `metrics` crate for instrumentation and exports to Prometheus
//! format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "courier_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "courier_connections_active";
    pub const EVENTS_TOTAL: &str = "courier_events_total";
    pub const DELIVERIES_TOTAL: &str = "courier_deliveries_total";
    pub const REJECTIONS_TOTAL: &str = "courier_rejections_total";
    pub const PRESENCE_TRANSITIONS_TOTAL: &str = "courier_presence_transitions_total";
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
    metrics::describe_counter!(names::EVENTS_TOTAL, "Total number of submitted events");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Per-channel delivery attempts by result"
    );
    metrics::describe_counter!(names::REJECTIONS_TOTAL, "Total number of rejected events");
    metrics::describe_counter!(
        names::PRESENCE_TRANSITIONS_TOTAL,
        "Total number of online/offline transitions broadcast"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a submitted event by kind.
pub fn record_event(kind: &'static str) {
    counter!(names::EVENTS_TOTAL, "kind" => kind).increment(1);
}

/// Record the outcome counts of one dispatch.
pub fn record_deliveries(delivered: usize, failed: usize) {
    counter!(names::DELIVERIES_TOTAL, "result" => "delivered").increment(delivered as u64);
    counter!(names::DELIVERIES_TOTAL, "result" => "failed").increment(failed as u64);
}

/// Record a rejected submit.
pub fn record_rejection(code: u16) {
    counter!(names::REJECTIONS_TOTAL, "code" => code.to_string()).increment(1);
}

/// Record a presence transition broadcast.
pub fn record_presence_transition(online: bool) {
    let direction = if online { "online" } else { "offline" };
    counter!(names::PRESENCE_TRANSITIONS_TOTAL, "direction" => direction).increment(1);
}

/// RAII guard recording connect/disconnect on the active-connections gauge.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
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
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}
