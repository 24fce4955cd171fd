//! Prometheus metrics for the broker connection
//!
//! Also owns the process-wide Prometheus recorder used by every crate in the workspace.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() {
    let _ = PROMETHEUS_HANDLE.get_or_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("Failed to install Prometheus recorder");
        info!("Prometheus metrics initialized");
        handle
    });
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Connection manager metrics helper
#[derive(Clone)]
pub struct ConnectionMetrics {
    /// Connection name for labeling
    connection_name: String,
}

impl ConnectionMetrics {
    pub fn new(connection_name: impl Into<String>) -> Self {
        Self {
            connection_name: connection_name.into(),
        }
    }

    /// Record a successful connect (initial or reconnect)
    pub fn connected(&self) {
        counter!(
            "amqp_connects_total",
            "connection" => self.connection_name.clone()
        )
        .increment(1);
        self.connected_gauge(true);
    }

    /// Record a lost connection
    pub fn disconnected(&self) {
        counter!(
            "amqp_disconnects_total",
            "connection" => self.connection_name.clone()
        )
        .increment(1);
        self.connected_gauge(false);
    }

    /// Record a reconnect attempt
    pub fn reconnect_attempt(&self) {
        counter!(
            "amqp_reconnect_attempts_total",
            "connection" => self.connection_name.clone()
        )
        .increment(1);
    }

    /// Record reconnect budget exhaustion
    pub fn reconnect_exhausted(&self) {
        counter!(
            "amqp_reconnect_exhausted_total",
            "connection" => self.connection_name.clone()
        )
        .increment(1);
        self.connected_gauge(false);
    }

    fn connected_gauge(&self, connected: bool) {
        gauge!(
            "amqp_connected",
            "connection" => self.connection_name.clone()
        )
        .set(if connected { 1.0 } else { 0.0 });
    }
}
