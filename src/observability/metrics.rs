//! Metrics collection and exposition.
//!
//! # Metrics
//! - `diameter_connections_accepted_total` (counter): by protocol, security
//! - `diameter_handshakes_total` (counter): by outcome
//! - `diameter_handshake_duration_seconds` (histogram): accept to outcome
//! - `diameter_pending_handshakes` (gauge): outstanding handshakes per listener
//! - `diameter_queue_depth` (gauge): depth at the last watermark crossing
//! - `diameter_queue_watermark_total` (counter): crossings by queue, level
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   exporter every call is a no-op
//! - The Prometheus exporter serves its own HTTP listener

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::net::connection::{Protocol, Security};

/// Install the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_connection_accepted(protocol: Protocol, security: Security) {
    counter!(
        "diameter_connections_accepted_total",
        "protocol" => protocol.to_string(),
        "security" => security.to_string()
    )
    .increment(1);
}

pub fn record_handshake(outcome: &'static str, elapsed: Duration) {
    counter!("diameter_handshakes_total", "outcome" => outcome).increment(1);
    histogram!("diameter_handshake_duration_seconds", "outcome" => outcome)
        .record(elapsed.as_secs_f64());
}

pub fn set_pending_handshakes(listener: &str, count: usize) {
    gauge!("diameter_pending_handshakes", "listener" => listener.to_string()).set(count as f64);
}

pub fn record_watermark(queue: &str, level: &'static str, depth: usize) {
    counter!(
        "diameter_queue_watermark_total",
        "queue" => queue.to_string(),
        "level" => level
    )
    .increment(1);
    gauge!("diameter_queue_depth", "queue" => queue.to_string()).set(depth as f64);
}
