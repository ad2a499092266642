//! Compiled-in middleware handlers.

use std::collections::BTreeMap;
use std::time::Instant;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;

use crate::middleware::handler::{Exchange, Middleware, MiddlewareError};
use crate::middleware::pipeline::Next;

/// Logs method, path, status and latency of every exchange it sees.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestLogger;

impl Middleware for RequestLogger {
    fn handle<'a>(
        &'a self,
        _config: &'a Value,
        exchange: Exchange,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<Exchange, MiddlewareError>> {
        Box::pin(async move {
            let method = exchange.request.method.clone();
            let path = exchange.path().to_string();
            let request_id = exchange.request_id.clone();
            let started = Instant::now();

            let result = next.run(exchange).await;
            let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;

            match &result {
                Ok(exchange) => tracing::info!(
                    request_id = %request_id,
                    method = %method,
                    path = %path,
                    status = exchange.response.as_ref().map(|r| r.status().as_u16()),
                    latency_ms,
                    "Request processed"
                ),
                Err(e) => tracing::info!(
                    request_id = %request_id,
                    method = %method,
                    path = %path,
                    error = %e,
                    latency_ms,
                    "Request failed"
                ),
            }
            result
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HeaderInjectionConfig {
    #[serde(default)]
    request_headers: BTreeMap<String, String>,
    #[serde(default)]
    response_headers: BTreeMap<String, String>,
}

/// Sets request headers before the rest of the pipeline runs and response
/// headers after it returns.
///
/// Config: `{ "request_headers": { .. }, "response_headers": { .. } }`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderInjection;

impl HeaderInjection {
    fn parse(config: &Value) -> Result<HeaderInjectionConfig, MiddlewareError> {
        if config.is_null() {
            return Ok(HeaderInjectionConfig::default());
        }
        HeaderInjectionConfig::deserialize(config).map_err(|e| MiddlewareError::config(e.to_string()))
    }
}

fn apply(headers: &mut HeaderMap, values: &BTreeMap<String, String>) -> Result<(), MiddlewareError> {
    for (name, value) in values {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| MiddlewareError::config(format!("header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| MiddlewareError::config(format!("header value for '{name}': {e}")))?;
        headers.insert(name, value);
    }
    Ok(())
}

impl Middleware for HeaderInjection {
    fn handle<'a>(
        &'a self,
        config: &'a Value,
        mut exchange: Exchange,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<Exchange, MiddlewareError>> {
        Box::pin(async move {
            let config = Self::parse(config)?;
            apply(&mut exchange.request.headers, &config.request_headers)?;

            let mut exchange = next.run(exchange).await?;
            if let Some(response) = exchange.response.as_mut() {
                apply(response.headers_mut(), &config.response_headers)?;
            }
            Ok(exchange)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::middleware::chain::MiddlewareChain;
    use crate::middleware::testing::{MiddlewareTester, SyntheticRequest};

    fn tester() -> (Arc<MiddlewareChain>, MiddlewareTester) {
        let chain = Arc::new(MiddlewareChain::default());
        chain
            .register("inject", Arc::new(HeaderInjection), 1, vec!["*".into()], "pre-routing", Value::Null)
            .unwrap();
        chain
            .register("log", Arc::new(RequestLogger), 2, vec!["*".into()], "pre-routing", Value::Null)
            .unwrap();
        let tester = MiddlewareTester::new(Arc::clone(&chain), Duration::from_secs(1));
        (chain, tester)
    }

    #[tokio::test]
    async fn test_header_injection_sets_both_directions() {
        let (_chain, tester) = tester();
        let report = tester
            .test(
                "inject",
                SyntheticRequest {
                    config: Some(json!({
                        "request_headers": { "x-tenant": "acme" },
                        "response_headers": { "x-served-by": "gateway" }
                    })),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(report.success, "{report:?}");
        assert_eq!(report.request_headers.get("x-tenant").map(String::as_str), Some("acme"));
        assert_eq!(report.headers.get("x-served-by").map(String::as_str), Some("gateway"));
    }

    #[tokio::test]
    async fn test_header_injection_rejects_bad_config() {
        let (_chain, tester) = tester();
        for config in [json!({ "request_headers": 5 }), json!({ "request_headers": { "bad header": "v" } })] {
            let report = tester
                .test(
                    "inject",
                    SyntheticRequest {
                        config: Some(config),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert!(!report.success);
            assert!(report.error.unwrap().contains("invalid middleware config"));
        }
    }

    #[tokio::test]
    async fn test_request_logger_logs_status() {
        let (_chain, tester) = tester();
        let report = tester
            .test(
                "log",
                SyntheticRequest {
                    path: "/health/deep".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(report.success);
        assert!(report
            .logs
            .iter()
            .any(|l| l.contains("Request processed") && l.contains("status=200")));
    }
}
