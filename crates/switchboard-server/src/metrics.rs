//! Metrics collection and export for Switchboard.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{Instance, InstanceStats, Route};
use tokio::task::JoinHandle;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "switchboard_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "switchboard_connections_active";
    pub const SESSIONS_ACTIVE: &str = "switchboard_sessions_active";
    pub const MESSAGES_TOTAL: &str = "switchboard_messages_total";
    pub const MESSAGES_BYTES: &str = "switchboard_messages_bytes";
    pub const ROUTE_LATENCY_SECONDS: &str = "switchboard_route_latency_seconds";
    pub const ERRORS_TOTAL: &str = "switchboard_errors_total";
}

/// How often instance statistics are copied into the exporter.
pub const STATS_SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Initialize the metrics system.
pub fn init_metrics() {
    // Describe metrics
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open WebSocket connections"
    );
    metrics::describe_gauge!(
        names::SESSIONS_ACTIVE,
        "Current number of users registered on this instance"
    );
    metrics::describe_counter!(
        names::MESSAGES_TOTAL,
        "Messages by route: published, buffered, delivered, dropped, drained"
    );
    metrics::describe_counter!(names::MESSAGES_BYTES, "Bytes of inbound messages by route");
    metrics::describe_histogram!(
        names::ROUTE_LATENCY_SECONDS,
        "Time to route one inbound message in seconds"
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

/// Record where an inbound message went.
pub fn record_route(route: Route, bytes: usize) {
    let label = route.as_str();
    counter!(names::MESSAGES_TOTAL, "route" => label).increment(1);
    counter!(names::MESSAGES_BYTES, "route" => label).increment(bytes as u64);
}

/// Record routing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::ROUTE_LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Copy an instance's running totals into the exporter.
pub fn record_instance_stats(stats: &InstanceStats) {
    gauge!(names::SESSIONS_ACTIVE).set(stats.sessions as f64);
    counter!(names::MESSAGES_TOTAL, "route" => "delivered").absolute(stats.relay_delivered);
    counter!(names::MESSAGES_TOTAL, "route" => "relay_dropped").absolute(stats.relay_dropped);
    counter!(names::MESSAGES_TOTAL, "route" => "drained").absolute(stats.mailbox_drained);
}

/// Periodically export an instance's statistics.
#[must_use]
pub fn spawn_stats_sync(instance: Arc<Instance>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            record_instance_stats(&instance.stats());
        }
    })
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
