//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by method, status
//! - `gateway_request_duration_seconds` (histogram): latency distribution
//! - `gateway_rate_limited_total` (counter): 429 responses
//! - `gateway_backend_fail_open_total` (counter): degraded backend calls by component
//! - `gateway_idempotent_replays_total` (counter): responses served from the cache
//! - `gateway_authz_rejections_total` (counter): guard rejections by code
//!
//! Recording is a no-op until a recorder is installed, so library users and
//! tests pay nothing.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    counter!(
        "gateway_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("gateway_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_rate_limited() {
    counter!("gateway_rate_limited_total").increment(1);
}

pub fn record_fail_open(component: &'static str) {
    counter!("gateway_backend_fail_open_total", "component" => component).increment(1);
}

pub fn record_idempotent_replay() {
    counter!("gateway_idempotent_replays_total").increment(1);
}

pub fn record_authz_rejection(code: &'static str) {
    counter!("gateway_authz_rejections_total", "code" => code).increment(1);
}
