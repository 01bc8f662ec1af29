//! Metrics collection and export for RedWeb.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format. Route events are recorded through [`ServerHooks`].

use anyhow::{Context, Result};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use redweb_core::{CloseReason, Connection, DispatchError, RouteHooks};
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "redweb_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "redweb_connections_active";
    pub const EVICTIONS_TOTAL: &str = "redweb_evictions_total";
    pub const DISPATCHES_TOTAL: &str = "redweb_dispatches_total";
    pub const CLOSES_TOTAL: &str = "redweb_closes_total";
    pub const ERRORS_TOTAL: &str = "redweb_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of registered connections"
    );
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Connections superseded by a newer one with the same identity"
    );
    metrics::describe_counter!(names::DISPATCHES_TOTAL, "Frames handed to a handler");
    metrics::describe_counter!(names::CLOSES_TOTAL, "Closed connections by reason");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Rejected frames and handler faults");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Route hooks that record connection and dispatch metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerHooks;

impl RouteHooks for ServerHooks {
    fn on_open(&self, conn: &Connection) {
        counter!(names::CONNECTIONS_TOTAL, "path" => conn.path().to_string()).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE, "path" => conn.path().to_string()).increment(1.0);
    }

    fn on_close(&self, conn: &Connection, reason: CloseReason) {
        gauge!(names::CONNECTIONS_ACTIVE, "path" => conn.path().to_string()).decrement(1.0);
        counter!(names::CLOSES_TOTAL, "reason" => reason.as_str()).increment(1);
    }

    fn on_evict(&self, conn: &Connection) {
        counter!(names::EVICTIONS_TOTAL, "path" => conn.path().to_string()).increment(1);
    }

    fn on_dispatch(&self, _conn: &Connection, handler: &str) {
        counter!(names::DISPATCHES_TOTAL, "handler" => handler.to_string()).increment(1);
    }

    fn on_error(&self, _conn: &Connection, error: &DispatchError) {
        counter!(names::ERRORS_TOTAL, "kind" => error.kind()).increment(1);
    }
}
