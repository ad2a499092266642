//! Handler contract for chain middleware.
//!
//! # Responsibilities
//! - Define the request/response context that flows through a pipeline
//! - Define the `Middleware` capability and the terminal continuation
//!
//! # Design Decisions
//! - Handlers are trait objects; the chain never knows how one was produced
//! - The entry's opaque config is passed on every call, so config changes and
//!   rollbacks apply without re-resolving the handler
//! - Bodies are buffered (`Bytes`) so later phases can inspect responses

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::http::{request, Response};
use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use crate::error::GatewayError;
use crate::middleware::pipeline::Next;
use crate::routing::ServiceRoute;

/// Errors raised by middleware handlers and terminals.
#[derive(Debug, Clone, Error)]
pub enum MiddlewareError {
    #[error("{0}")]
    Handler(String),

    #[error("invalid middleware config: {0}")]
    Config(String),

    #[error("handler panicked: {0}")]
    Panic(String),

    /// Raised by the terminal (forwarder); passed to the client as is.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl MiddlewareError {
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// One request on its way through the gateway.
#[derive(Debug)]
pub struct Exchange {
    pub request_id: String,
    pub client_addr: Option<SocketAddr>,
    /// Request line and headers.
    pub request: request::Parts,
    pub body: Bytes,
    /// Service matched by the route table, if any.
    pub service: Option<Arc<ServiceRoute>>,
    /// Set by the forwarder or by a middleware that answers directly.
    pub response: Option<Response<Bytes>>,
    /// Whether the backend was actually called.
    pub upstream_called: bool,
}

impl Exchange {
    pub fn new(
        request_id: impl Into<String>,
        client_addr: Option<SocketAddr>,
        request: request::Parts,
        body: Bytes,
        service: Option<Arc<ServiceRoute>>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            client_addr,
            request,
            body,
            service,
            response: None,
            upstream_called: false,
        }
    }

    pub fn path(&self) -> &str {
        self.request.uri.path()
    }

    /// Answer the request without calling further continuations.
    pub fn respond(mut self, response: Response<Bytes>) -> Self {
        self.response = Some(response);
        self
    }
}

/// A request processor.
///
/// A handler may call `next.run(exchange)` to continue the pipeline, or
/// return without calling it to terminate the request itself.
pub trait Middleware: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        config: &'a Value,
        exchange: Exchange,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<Exchange, MiddlewareError>>;

    /// Release resources on unregistration.
    fn cleanup(&self) -> Result<(), MiddlewareError> {
        Ok(())
    }
}

/// What runs after the last entry of a pipeline.
pub trait Terminal: Send + Sync {
    fn call<'a>(&'a self, exchange: Exchange) -> BoxFuture<'a, Result<Exchange, MiddlewareError>>;
}

/// Terminal that returns the exchange unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Terminal for Passthrough {
    fn call<'a>(&'a self, exchange: Exchange) -> BoxFuture<'a, Result<Exchange, MiddlewareError>> {
        Box::pin(async move { Ok(exchange) })
    }
}
