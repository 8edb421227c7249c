//! Prometheus metrics exposition server.
//!
//! This module provides an HTTP server that exposes pushmail metrics
//! in Prometheus format on a configurable port.

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Register all metric descriptions for Prometheus.
///
/// Called once after the recorder is installed; descriptions become the
/// HELP text in the exposition output.
pub fn register_metric_descriptions() {
    use metrics::{describe_counter, describe_gauge};

    describe_counter!(
        "pushmail_events_received_total",
        "Total number of notifications read from the event stream"
    );
    describe_counter!(
        "pushmail_events_filtered_total",
        "Total number of self-generated diagnostics skipped by the bridge"
    );
    describe_counter!(
        "pushmail_emails_sent_total",
        "Total number of notifications delivered by email"
    );
    describe_counter!(
        "pushmail_email_errors_total",
        "Total number of failed email submissions"
    );
    describe_counter!(
        "pushmail_read_errors_total",
        "Total number of read or decode errors on the event stream"
    );
    describe_counter!(
        "pushmail_connect_attempts_total",
        "Total number of dial attempts to the event stream"
    );
    describe_counter!(
        "pushmail_hub_messages_dropped_total",
        "Total number of diagnostics dropped because the hub messenger queue was full"
    );

    describe_gauge!(
        "pushmail_stream_up",
        "Event stream subscription status (1=subscribed, 0=down)"
    );
    describe_gauge!(
        "pushmail_build_info",
        "Build information with version label (always 1)"
    );
}

/// Initialize all known metrics so they are visible before any event.
pub fn initialize_metrics() {
    use metrics::{counter, gauge};

    gauge!("pushmail_build_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
    gauge!("pushmail_stream_up").set(0.0);

    for name in [
        "pushmail_events_received_total",
        "pushmail_events_filtered_total",
        "pushmail_emails_sent_total",
        "pushmail_email_errors_total",
        "pushmail_read_errors_total",
        "pushmail_connect_attempts_total",
        "pushmail_hub_messages_dropped_total",
    ] {
        counter!(name).absolute(0);
    }
}

/// Metrics server for Prometheus exposition.
///
/// Serves metrics on `/metrics`.
pub struct MetricsServer {
    port: u16,
    /// Signaled once the recorder is installed, so callers do not emit
    /// metrics that would be lost.
    ready_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MetricsServer {
    /// Use port 0 to let the OS assign an available port.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ready_tx: None,
        }
    }

    pub fn with_ready_signal(port: u16, ready_tx: tokio::sync::oneshot::Sender<()>) -> Self {
        Self {
            port,
            ready_tx: Some(ready_tx),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Install the global recorder with its HTTP listener and run until
    /// cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the exporter cannot be installed (port in use, or
    /// a recorder already installed in this process).
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();

        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

        register_metric_descriptions();
        initialize_metrics();

        if let Some(tx) = self.ready_tx {
            let _ = tx.send(());
        }

        info!(port = self.port, "Metrics server started on /metrics");
        cancel.cancelled().await;
        info!("Metrics server shutting down");

        Ok(())
    }
}
