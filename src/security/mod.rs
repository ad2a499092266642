//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → rate_limit.rs (per-key token bucket, before routing)
//!     → Pass to routing and the middleware chain
//! ```
//!
//! # Design Decisions
//! - Fail closed: over-limit requests are rejected with 429 + Retry-After
//! - Admission runs before any route lookup or middleware work

pub mod rate_limit;

pub use rate_limit::{rate_limit_middleware, RateLimiter};
