//! Sandbox execution of a single middleware.
//!
//! # Responsibilities
//! - Run one entry's handler against a synthetic request in isolation
//! - Report outcome, duration, the synthetic response and captured log output
//!
//! # Design Decisions
//! - The run uses a sandbox pipeline that records nothing: live metrics, health
//!   and auto-rollback never see test traffic
//! - Log output is captured by a dedicated `tracing` subscriber scoped to the
//!   test future; work the handler spawns onto other tasks is not captured
//! - The terminal echoes the request body with `200 OK` instead of calling a
//!   backend

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::http::{HeaderMap, Method, Request, Response, StatusCode};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument::WithSubscriber;
use tracing::Level;

use crate::error::GatewayError;
use crate::middleware::chain::MiddlewareChain;
use crate::middleware::handler::{Exchange, MiddlewareError, Terminal};
use crate::middleware::pipeline::Pipeline;

/// Description of the request to feed the handler.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyntheticRequest {
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    /// Run with this config instead of the entry's current one.
    pub config: Option<Value>,
}

impl Default for SyntheticRequest {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            path: "/".to_string(),
            headers: BTreeMap::new(),
            body: String::new(),
            config: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub middleware: String,
    pub success: bool,
    pub duration_ms: f64,
    /// Request headers as the handler left them.
    pub request_headers: BTreeMap<String, String>,
    pub status: Option<u16>,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    /// Log lines emitted while the handler ran.
    pub logs: Vec<String>,
    pub error: Option<String>,
}

impl TestReport {
    fn failed(middleware: &str, error: impl Into<String>) -> Self {
        Self {
            middleware: middleware.to_string(),
            success: false,
            duration_ms: 0.0,
            request_headers: BTreeMap::new(),
            status: None,
            headers: BTreeMap::new(),
            body: String::new(),
            logs: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Answers every sandboxed request with `200 OK` and the request body.
#[derive(Debug, Default, Clone, Copy)]
pub struct SandboxTerminal;

impl Terminal for SandboxTerminal {
    fn call<'a>(&'a self, exchange: Exchange) -> BoxFuture<'a, Result<Exchange, MiddlewareError>> {
        Box::pin(async move {
            let response = Response::builder()
                .status(StatusCode::OK)
                .header("x-sandbox", "true")
                .body(exchange.body.clone())
                .map_err(|e| MiddlewareError::handler(e.to_string()))?;
            Ok(exchange.respond(response))
        })
    }
}

/// Shared in-memory sink for captured log output.
#[derive(Debug, Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock())
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct MiddlewareTester {
    chain: Arc<MiddlewareChain>,
    timeout: Duration,
}

impl MiddlewareTester {
    pub fn new(chain: Arc<MiddlewareChain>, timeout: Duration) -> Self {
        Self { chain, timeout }
    }

    /// Run `name` once against `request` in the sandbox.
    pub async fn test(&self, name: &str, request: SyntheticRequest) -> Result<TestReport, GatewayError> {
        let entry = self
            .chain
            .get(name)
            .ok_or_else(|| GatewayError::not_found("middleware", name))?;

        let entry = match request.config.clone() {
            Some(config) => {
                let mut settings = entry.settings().clone();
                settings.config = config;
                Arc::new(entry.restored(settings))
            }
            None => entry,
        };

        let exchange = match build_exchange(&request) {
            Ok(exchange) => exchange,
            Err(reason) => return Ok(TestReport::failed(name, reason)),
        };

        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .with_ansi(false)
            .without_time()
            .with_max_level(Level::DEBUG)
            .finish();

        let pipeline = Pipeline::new(entry.settings().phase, vec![entry], None);
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.timeout,
            pipeline
                .execute_sandboxed(exchange, &SandboxTerminal)
                .with_subscriber(subscriber),
        )
        .await;
        let duration_ms = started.elapsed().as_secs_f64() * 1_000.0;

        let mut report = TestReport::failed(name, "");
        report.duration_ms = duration_ms;
        match outcome {
            Ok(Ok(exchange)) => {
                report.success = true;
                report.error = None;
                report.request_headers = header_map(&exchange.request.headers);
                if let Some(response) = exchange.response {
                    report.status = Some(response.status().as_u16());
                    report.headers = header_map(response.headers());
                    report.body = String::from_utf8_lossy(response.body()).into_owned();
                }
            }
            Ok(Err(e)) => {
                report.status = Some(e.status().as_u16());
                report.error = Some(e.to_string());
            }
            Err(_) => {
                report.error = Some(format!("timed out after {:?}", self.timeout));
            }
        }
        report.logs = logs.lines();

        tracing::info!(
            middleware = %name,
            success = report.success,
            duration_ms = report.duration_ms,
            "Sandbox test finished"
        );
        Ok(report)
    }
}

fn build_exchange(request: &SyntheticRequest) -> Result<Exchange, String> {
    let method = Method::from_bytes(request.method.as_bytes())
        .map_err(|e| format!("invalid method '{}': {e}", request.method))?;
    let mut builder = Request::builder().method(method).uri(request.path.as_str());
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let (parts, _) = builder
        .body(())
        .map_err(|e| format!("invalid synthetic request: {e}"))?
        .into_parts();

    Ok(Exchange::new(
        uuid::Uuid::new_v4().to_string(),
        None,
        parts,
        Bytes::from(request.body.clone()),
        None,
    ))
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
        .collect()
}
