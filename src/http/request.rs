//! Inbound request handling.
//!
//! # Responsibilities
//! - Read the request ID assigned by the request-id layer
//! - Buffer request bodies within the configured limit
//! - Build the upstream copy of a request
//!
//! # Design Decisions
//! - Bodies are buffered so retries and later phases can reuse them
//! - Hop-by-hop headers and `Host` are never forwarded; the upstream request
//!   carries `x-forwarded-for` and the gateway's request ID

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request};

use crate::error::GatewayError;
use crate::load_balancer::Target;
use crate::middleware::Exchange;
use crate::routing::ServiceRoute;

pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Connection-level headers that apply to a single hop only.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// The request ID set by the request-id layer, or a fresh one.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Read the whole body, failing when it exceeds `limit` bytes.
pub async fn buffer_body(body: Body, limit: usize) -> Result<Bytes, GatewayError> {
    axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| GatewayError::PayloadTooLarge(limit))
}

/// Build the request sent to `target` for this exchange.
pub fn upstream_request(
    exchange: &Exchange,
    route: &ServiceRoute,
    target: &Target,
) -> Result<Request<Body>, GatewayError> {
    let path = route.upstream_path(exchange.path(), exchange.request.uri.query());
    let uri = format!("http://{}{}", target.address, path);

    let mut request = Request::builder()
        .method(exchange.request.method.clone())
        .uri(uri)
        .body(Body::from(exchange.body.clone()))
        .map_err(|e| GatewayError::UpstreamFailed {
            target: target.address.clone(),
            reason: format!("invalid upstream request: {e}"),
        })?;

    let headers = request.headers_mut();
    for (name, value) in &exchange.request.headers {
        headers.append(name.clone(), value.clone());
    }
    strip_hop_by_hop(headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    if let Some(client) = exchange.client_addr {
        let forwarded = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{existing}, {}", client.ip()),
            None => client.ip().to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert(HeaderName::from_static(X_FORWARDED_FOR), value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&exchange.request_id) {
        headers.insert(HeaderName::from_static(X_REQUEST_ID), value);
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::config::schema::{ServiceConfig, TargetConfig};

    fn route(strip: bool) -> ServiceRoute {
        ServiceRoute::from_config(&ServiceConfig {
            name: "users".into(),
            path_prefix: "/users".into(),
            targets: vec![TargetConfig {
                address: "127.0.0.1:9000".into(),
                weight: 1,
            }],
            strip_prefix: strip,
            ..Default::default()
        })
    }

    #[test]
    fn test_upstream_request_rewrites_headers() {
        let (parts, _) = Request::builder()
            .uri("/users/7?full=1")
            .header("host", "gateway.local")
            .header("connection", "keep-alive")
            .header("x-forwarded-for", "10.0.0.1")
            .header("x-custom", "kept")
            .body(())
            .unwrap()
            .into_parts();
        let client: SocketAddr = "192.168.1.5:51000".parse().unwrap();
        let exchange = Exchange::new("req-1", Some(client), parts, Bytes::from_static(b"{}"), None);
        let target = Target::new("127.0.0.1:9000").unwrap();

        let request = upstream_request(&exchange, &route(true), &target).unwrap();
        assert_eq!(request.uri(), "http://127.0.0.1:9000/7?full=1");
        let headers = request.headers();
        assert!(headers.get("host").is_none());
        assert!(headers.get("connection").is_none());
        assert_eq!(headers["x-custom"], "kept");
        assert_eq!(headers["x-forwarded-for"], "10.0.0.1, 192.168.1.5");
        assert_eq!(headers["x-request-id"], "req-1");

        let request = upstream_request(&exchange, &route(false), &target).unwrap();
        assert_eq!(request.uri(), "http://127.0.0.1:9000/users/7?full=1");
    }

    #[tokio::test]
    async fn test_buffer_body_limit() {
        assert_eq!(buffer_body(Body::from("abc"), 3).await.unwrap(), "abc");
        assert_eq!(
            buffer_body(Body::from("abcd"), 3).await.unwrap_err(),
            GatewayError::PayloadTooLarge(3)
        );
    }
}
