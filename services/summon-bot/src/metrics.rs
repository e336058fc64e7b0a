//! Prometheus metrics exposition
//!
//! The library crates emit through the `metrics` facade:
//!
//! - `token_refresh_total` (counter): labels `class`, `outcome`
//! - `chat_reconnect_attempts_total` (counter): label `trigger`
//! - `chat_connected` (gauge)
//! - `notifications_total` (counter): label `severity`
//!
//! This module installs the recorder that renders them on `/metrics`, plus
//! the service's own request counter.

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Record an operator API request by route and status.
pub fn record_api_request(route: &'static str, status: u16) {
    metrics::counter!("api_requests_total", "route" => route, "status" => status.to_string())
        .increment(1);
}
