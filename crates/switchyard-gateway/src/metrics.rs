//! Metrics collection and export for Switchyard.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use switchyard_core::{HandshakeError, HubStats, Termination};
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "switchyard_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "switchyard_connections_active";
    pub const DISCONNECTIONS_TOTAL: &str = "switchyard_disconnections_total";
    pub const HANDSHAKE_FAILURES_TOTAL: &str = "switchyard_handshake_failures_total";
    pub const PUBLISHED_TOTAL: &str = "switchyard_published_total";
    pub const EVENTS_DELIVERED: &str = "switchyard_events_delivered";
    pub const EVENTS_DROPPED: &str = "switchyard_events_dropped";
    pub const USERS_ONLINE: &str = "switchyard_users_online";
    pub const CHANNELS_ACTIVE: &str = "switchyard_channels_active";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "switchyard_subscriptions_active";
    pub const VOICE_CHANNELS_ACTIVE: &str = "switchyard_voice_channels_active";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of upgraded connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open connections"
    );
    metrics::describe_counter!(
        names::DISCONNECTIONS_TOTAL,
        "Connections ended, by reason"
    );
    metrics::describe_counter!(
        names::HANDSHAKE_FAILURES_TOTAL,
        "Connections rejected during IDENTIFY, by reason"
    );
    metrics::describe_counter!(
        names::PUBLISHED_TOTAL,
        "Events accepted by the internal publish endpoint"
    );
    metrics::describe_gauge!(
        names::EVENTS_DELIVERED,
        "Frames accepted by recipient queues since start"
    );
    metrics::describe_gauge!(
        names::EVENTS_DROPPED,
        "Frames discarded by backpressure since start"
    );
    metrics::describe_gauge!(names::USERS_ONLINE, "Current number of online users");
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Current number of active channels");
    metrics::describe_gauge!(
        names::SUBSCRIPTIONS_ACTIVE,
        "Current number of channel subscriptions"
    );
    metrics::describe_gauge!(
        names::VOICE_CHANNELS_ACTIVE,
        "Current number of occupied voice channels"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
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

/// Record why a registered connection ended.
pub fn record_termination(reason: Termination) {
    counter!(names::DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
}

/// Record a rejected handshake.
pub fn record_handshake_failure(error: &HandshakeError) {
    counter!(names::HANDSHAKE_FAILURES_TOTAL, "reason" => error.kind()).increment(1);
}

/// Record an event from the publish endpoint.
pub fn record_published(target: &'static str) {
    counter!(names::PUBLISHED_TOTAL, "target" => target).increment(1);
}

/// Copy a hub snapshot into the gauges.
#[allow(clippy::cast_precision_loss)]
pub fn record_hub_stats(stats: &HubStats) {
    gauge!(names::USERS_ONLINE).set(stats.online_users as f64);
    gauge!(names::CHANNELS_ACTIVE).set(stats.channel_count as f64);
    gauge!(names::SUBSCRIPTIONS_ACTIVE).set(stats.total_subscriptions as f64);
    gauge!(names::VOICE_CHANNELS_ACTIVE).set(stats.voice_channels as f64);
    gauge!(names::EVENTS_DELIVERED).set(stats.events_delivered as f64);
    gauge!(names::EVENTS_DROPPED).set(stats.events_dropped as f64);
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
