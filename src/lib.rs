//! API gateway core.
//!
//! Admission control, service routing, a dynamic middleware chain with health
//! monitoring, sandbox testing and rollback, and a resilient forwarder
//! (load balancing, active health checks, circuit breakers, retries).

pub mod admin;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod middleware;
pub mod observability;
pub mod resilience;
pub mod routing;
pub mod security;

pub use config::schema::GatewayConfig;
pub use error::GatewayError;
pub use http::{AppState, HttpServer};
pub use lifecycle::Shutdown;
pub use middleware::MiddlewareChain;
