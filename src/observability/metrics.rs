//! Metrics collection and exposition.
//!
//! # Metrics
//! - `master_active_connections` (gauge): in-flight connection count
//! - `master_connection_underflows_total` (counter): unpaired decrements
//! - `master_drain_forced_total` (counter): drains cut short by the deadline
//! - `master_lifecycle_state` (gauge): 0=running, 1=draining, 2=exiting
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and is a no-op until a
//!   recorder is installed
//! - The Prometheus exporter is opt-in via `metrics_address`

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::lifecycle::MonitorState;

/// Install the Prometheus exporter listening on `addr`.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter started"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to start metrics exporter"),
    }
}

pub fn record_active_connections(count: u64) {
    metrics::gauge!("master_active_connections").set(count as f64);
}

pub fn record_connection_underflow() {
    metrics::counter!("master_connection_underflows_total").increment(1);
}

pub fn record_forced_drain() {
    metrics::counter!("master_drain_forced_total").increment(1);
}

pub fn record_state(state: MonitorState) {
    metrics::gauge!("master_lifecycle_state").set(state as u8 as f64);
}
