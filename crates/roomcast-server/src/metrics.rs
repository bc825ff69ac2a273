//! Metrics collection and export for roomcast.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use roomcast_core::{Engine, EngineStats};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Metric names.
pub mod names {
    pub const MESSAGES_TOTAL: &str = "roomcast_messages_total";
    pub const TYPING_TOTAL: &str = "roomcast_typing_events_total";
    pub const STREAMS_TOTAL: &str = "roomcast_streams_total";
    pub const STREAMS_ACTIVE: &str = "roomcast_streams_active";
    pub const ROOMS_ACTIVE: &str = "roomcast_rooms_active";
    pub const DELIVERED_TOTAL: &str = "roomcast_delivered_total";
    pub const DROPPED_TOTAL: &str = "roomcast_dropped_total";
    pub const PUBLISH_FAILURES_TOTAL: &str = "roomcast_publish_failures_total";
    pub const ERRORS_TOTAL: &str = "roomcast_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Chat messages accepted");
    metrics::describe_counter!(names::TYPING_TOTAL, "Typing events accepted");
    metrics::describe_counter!(names::STREAMS_TOTAL, "Live streams opened since start");
    metrics::describe_gauge!(names::STREAMS_ACTIVE, "Currently open live streams");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Rooms with a live topic subscription");
    metrics::describe_gauge!(names::DELIVERED_TOTAL, "Records queued to viewers");
    metrics::describe_gauge!(
        names::DROPPED_TOTAL,
        "Records dropped for overloaded viewers, by kind"
    );
    metrics::describe_gauge!(
        names::PUBLISH_FAILURES_TOTAL,
        "Persisted messages that could not be published"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Request errors by type");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new().with_http_listener(addr).install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record an accepted chat message.
pub fn record_message() {
    counter!(names::MESSAGES_TOTAL).increment(1);
}

/// Record an accepted typing event.
pub fn record_typing() {
    counter!(names::TYPING_TOTAL).increment(1);
}

/// Record a request error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Export a snapshot of the engine counters.
///
/// Engine counters are cumulative, so they are exported as gauges set to
/// the current value.
pub fn export_stats(stats: &EngineStats) {
    gauge!(names::ROOMS_ACTIVE).set(stats.active_rooms as f64);
    gauge!(names::DELIVERED_TOTAL).set(stats.delivered as f64);
    gauge!(names::DROPPED_TOTAL, "kind" => "message").set(stats.chat_dropped as f64);
    gauge!(names::DROPPED_TOTAL, "kind" => "typing").set(stats.typing_dropped as f64);
    gauge!(names::PUBLISH_FAILURES_TOTAL).set(stats.publish_failures as f64);
}

/// Periodically export engine counters.
pub fn spawn_stats_exporter(engine: Arc<Engine>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            export_stats(&engine.stats());
        }
    })
}

/// Metrics guard that tracks an open stream until dropped.
pub struct StreamMetricsGuard;

impl StreamMetricsGuard {
    /// Create a new metrics guard, recording a stream open.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::STREAMS_TOTAL).increment(1);
        gauge!(names::STREAMS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for StreamMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StreamMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::STREAMS_ACTIVE).decrement(1.0);
    }
}
