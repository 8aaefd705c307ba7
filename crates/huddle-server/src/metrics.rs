//! Metrics collection and export for the huddle server.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SESSIONS_TOTAL: &str = "huddle_ws_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "huddle_ws_sessions_active";
    pub const COMMANDS_TOTAL: &str = "huddle_ws_commands_total";
    pub const COMMAND_ERRORS_TOTAL: &str = "huddle_ws_command_errors_total";
}

/// Labels for a rejected client command.
#[derive(Debug, Clone, Copy)]
pub struct CommandErrorLabels {
    pub command: &'static str,
    pub reason: &'static str,
}

impl CommandErrorLabels {
    fn to_labels(self) -> [(&'static str, String); 2] {
        [
            ("command", self.command.to_string()),
            ("reason", self.reason.to_string()),
        ]
    }
}

/// Describe every metric family the process exports.
pub fn init_metrics() {
    metrics::describe_counter!(names::SESSIONS_TOTAL, "WebSocket sessions since start");
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Open WebSocket sessions");
    metrics::describe_counter!(names::COMMANDS_TOTAL, "Client commands handled");
    metrics::describe_counter!(
        names::COMMAND_ERRORS_TOTAL,
        "Client commands rejected, by reason"
    );

    huddle_broker::metrics::describe();
    huddle_core::metrics::describe();

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot bind its listener.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

pub fn record_command(command: &'static str) {
    counter!(names::COMMANDS_TOTAL, "command" => command).increment(1);
}

pub fn record_command_error(labels: CommandErrorLabels) {
    counter!(names::COMMAND_ERRORS_TOTAL, &labels.to_labels()).increment(1);
}

/// Tracks one WebSocket session for as long as it is alive.
pub struct SessionGuard;

impl SessionGuard {
    #[must_use]
    pub fn new() -> Self {
        counter!(names::SESSIONS_TOTAL).increment(1);
        gauge!(names::SESSIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for SessionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
    }
}
