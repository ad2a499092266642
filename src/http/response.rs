//! Response handling.
//!
//! # Responsibilities
//! - Turn the buffered response of an exchange into the client response
//! - Remove headers that must not cross the gateway
//! - Echo the request ID back to the client
//!
//! # Design Decisions
//! - `content-length` is dropped and recomputed from the buffered body, since
//!   pre-response middleware may have rewritten it

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderName, HeaderValue};
use axum::response::Response;

use crate::http::request::{strip_hop_by_hop, X_REQUEST_ID};

/// Build the client response from a buffered one.
pub fn into_client_response(response: axum::http::Response<Bytes>, request_id: &str) -> Response {
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    parts.headers.remove(header::CONTENT_LENGTH);
    if let Ok(value) = HeaderValue::from_str(request_id) {
        parts.headers.insert(HeaderName::from_static(X_REQUEST_ID), value);
    }
    Response::from_parts(parts, Body::from(body))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::*;

    #[test]
    fn test_client_response_headers() {
        let upstream = axum::http::Response::builder()
            .status(StatusCode::CREATED)
            .header("transfer-encoding", "chunked")
            .header("content-length", "999")
            .header("x-upstream", "yes")
            .body(Bytes::from_static(b"done"))
            .unwrap();

        let response = into_client_response(upstream, "req-42");
        assert_eq!(response.status(), StatusCode::CREATED);
        let headers = response.headers();
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("content-length").is_none());
        assert_eq!(headers["x-upstream"], "yes");
        assert_eq!(headers["x-request-id"], "req-42");
    }
}
