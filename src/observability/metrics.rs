//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define gateway metrics through the `metrics` facade
//! - Expose a Prometheus scrape endpoint when enabled
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by method, service, status
//! - `gateway_request_duration_seconds` (histogram): end-to-end latency
//! - `gateway_rate_limited_total` (counter): admission rejections
//! - `gateway_target_health` (gauge): 1=healthy, 0=unhealthy
//! - `gateway_circuit_state` (gauge): 0=closed, 1=open, 2=half-open
//! - `gateway_middleware_invocations_total` (counter): by middleware, outcome
//! - `gateway_middleware_duration_seconds` (histogram): handler self time
//! - `gateway_rollbacks_total` (counter): by middleware, trigger
//! - `gateway_alerts_total` (counter): by kind
//!
//! # Design Decisions
//! - Without an installed recorder every call is a no-op, so tests and
//!   library users pay nothing

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::resilience::circuit_breaker::CircuitState;

/// Install the Prometheus recorder with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, service: &str, status: u16, start: Instant) {
    counter!(
        "gateway_requests_total",
        "method" => method.to_string(),
        "service" => service.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        "gateway_request_duration_seconds",
        "method" => method.to_string(),
        "service" => service.to_string()
    )
    .record(start.elapsed().as_secs_f64());
}

pub fn record_rate_limited() {
    counter!("gateway_rate_limited_total").increment(1);
}

pub fn record_target_health(target: &str, healthy: bool) {
    gauge!("gateway_target_health", "target" => target.to_string()).set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_breaker_state(target: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::Open => 1.0,
        CircuitState::HalfOpen => 2.0,
    };
    gauge!("gateway_circuit_state", "target" => target.to_string()).set(value);
}

pub fn record_middleware(name: &str, success: bool, latency: Duration) {
    let outcome = if success { "success" } else { "failure" };
    counter!(
        "gateway_middleware_invocations_total",
        "middleware" => name.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("gateway_middleware_duration_seconds", "middleware" => name.to_string())
        .record(latency.as_secs_f64());
}

pub fn record_rollback(name: &str, trigger: &'static str) {
    counter!("gateway_rollbacks_total", "middleware" => name.to_string(), "trigger" => trigger).increment(1);
}

pub fn record_alert(kind: &'static str) {
    counter!("gateway_alerts_total", "kind" => kind).increment(1);
}
