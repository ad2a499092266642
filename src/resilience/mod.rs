//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to target:
//!     → circuit_breaker.rs (admit or fail fast per target)
//!     → per-route timeout (tokio::time::timeout in the forwarder)
//!     → On failure: retries.rs (retryable? budget left?) + backoff.rs (delay)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every upstream call has a deadline
//! - Retries only for idempotent requests (GET, HEAD, PUT, DELETE, ...)
//! - Circuit breaker prevents cascading failures
//! - Open circuits are not retried by the breaker itself

pub mod backoff;
pub mod circuit_breaker;
pub mod retries;

pub use circuit_breaker::{BreakerRegistry, BreakerSettings, CallPermit, CircuitBreaker, CircuitState};
pub use retries::RetryBudget;
