//! Gateway error taxonomy.
//!
//! # Responsibilities
//! - One error type shared by the admission, routing, chain and forwarding paths
//! - Map every outcome to a distinct, documented HTTP response
//!
//! # Design Decisions
//! - Backpressure (rate limit, open circuit) gets its own status + `x-gateway-outcome`
//!   header so callers can tell it apart from faults
//! - Internal processing errors never leak handler details to the client

use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    http::{self, header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Header naming the gateway-level outcome of a rejected request.
pub const X_GATEWAY_OUTCOME: &str = "x-gateway-outcome";

/// Errors surfaced by the gateway core.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// A middleware with this name is already registered.
    #[error("middleware '{0}' is already registered")]
    Conflict(String),

    /// Unknown entry, target or snapshot.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("priority {0} is outside the allowed range 0..=1000")]
    InvalidPriority(i64),

    #[error("unknown phase '{0}' (expected pre-routing, post-routing or pre-response)")]
    InvalidPhase(String),

    /// The target's circuit breaker is open; no network attempt was made.
    #[error("circuit open for target {target}")]
    CircuitOpen { target: String, retry_after: Duration },

    #[error("rate limit exceeded for '{key}'")]
    RateLimitExceeded { key: String, retry_after: Duration },

    /// No healthy target is available for the service.
    #[error("no healthy upstream for service '{0}'")]
    UpstreamUnavailable(String),

    /// A middleware handler failed; recovered at the chain boundary.
    #[error("middleware '{middleware}' failed: {reason}")]
    InternalProcessing { middleware: String, reason: String },

    #[error("upstream {target} timed out after {timeout:?}")]
    UpstreamTimeout { target: String, timeout: Duration },

    #[error("upstream {target} request failed: {reason}")]
    UpstreamFailed { target: String, reason: String },

    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("no route matches '{0}'")]
    NoRoute(String),
}

impl GatewayError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Whether the forwarder may try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamTimeout { .. } | GatewayError::UpstreamFailed { .. }
        )
    }

    /// Short outcome label used in logs, metrics and the outcome header.
    pub fn outcome(&self) -> &'static str {
        match self {
            GatewayError::Conflict(_) => "conflict",
            GatewayError::NotFound { .. } => "not-found",
            GatewayError::InvalidPriority(_) => "invalid-priority",
            GatewayError::InvalidPhase(_) => "invalid-phase",
            GatewayError::CircuitOpen { .. } => "circuit-open",
            GatewayError::RateLimitExceeded { .. } => "rate-limited",
            GatewayError::UpstreamUnavailable(_) => "upstream-unavailable",
            GatewayError::InternalProcessing { .. } => "internal-error",
            GatewayError::UpstreamTimeout { .. } => "upstream-timeout",
            GatewayError::UpstreamFailed { .. } => "upstream-failed",
            GatewayError::PayloadTooLarge(_) => "payload-too-large",
            GatewayError::NoRoute(_) => "no-route",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::NotFound { .. } | GatewayError::NoRoute(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidPriority(_) | GatewayError::InvalidPhase(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::CircuitOpen { .. } | GatewayError::UpstreamUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::InternalProcessing { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamFailed { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Seconds a client should wait before retrying, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::CircuitOpen { retry_after, .. }
            | GatewayError::RateLimitExceeded { retry_after, .. } => {
                Some(ceil_secs(*retry_after))
            }
            _ => None,
        }
    }
}

/// Round a duration up to whole seconds, never below one.
pub fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}

impl GatewayError {
    /// Buffered client response for this error.
    pub fn to_response(&self) -> http::Response<Bytes> {
        // Handler internals stay in the logs.
        let body = match self {
            GatewayError::InternalProcessing { .. } => "Internal server error".to_string(),
            other => other.to_string(),
        };

        let mut response = http::Response::new(Bytes::from(body));
        *response.status_mut() = self.status();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        headers.insert(X_GATEWAY_OUTCOME, HeaderValue::from_static(self.outcome()));
        if let Some(secs) = self.retry_after_secs() {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (parts, body) = self.to_response().into_parts();
        Response::from_parts(parts, Body::from(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_response_carries_retry_after() {
        let err = GatewayError::RateLimitExceeded {
            key: "ip:1.2.3.4".into(),
            retry_after: Duration::from_millis(1500),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
        assert_eq!(response.headers()[X_GATEWAY_OUTCOME], "rate-limited");
    }

    #[test]
    fn test_circuit_open_is_distinct_from_unavailable() {
        let open = GatewayError::CircuitOpen {
            target: "127.0.0.1:9000".into(),
            retry_after: Duration::from_secs(30),
        };
        let down = GatewayError::UpstreamUnavailable("users".into());
        assert_eq!(open.status(), down.status());
        assert_ne!(open.outcome(), down.outcome());
        assert!(!open.is_retryable());
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::from_secs(1)), 1);
        assert_eq!(ceil_secs(Duration::from_millis(1001)), 2);
        assert_eq!(ceil_secs(Duration::ZERO), 1);
    }
}
