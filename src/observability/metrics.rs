//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Expose a Prometheus-compatible metrics endpoint
//! - Document the metrics emitted across the daemon
//!
//! # Metrics
//! - `lloadd_client_connections` (gauge): live client connections
//! - `lloadd_upstream_dials_total` (counter): dial outcomes by `outcome`
//! - `lloadd_operations_total` (counter): finished operations by `result`
//! - `lloadd_backend_fitness` (gauge): best-of fitness score per `backend`
//!
//! # Design Decisions
//! - Metrics go through the `metrics` facade; without an installed
//!   recorder every update is a no-op
//! - The exporter runs its own HTTP listener, separate from the monitoring API

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and start its scrape endpoint.
///
/// Must be called inside a tokio runtime. Failure is logged and the daemon
/// runs without metrics.
pub fn init_metrics(addr: SocketAddr) -> bool {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            tracing::info!(address = %addr, "Metrics endpoint started");
            true
        }
        Err(e) => {
            tracing::error!(address = %addr, error = %e, "Failed to start metrics endpoint");
            false
        }
    }
}
