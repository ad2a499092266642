//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (path)
//!     → router.rs (longest-prefix service lookup)
//!     → Return: matched ServiceRoute or NoRoute
//!
//! Middleware applicability:
//!     route patterns + path
//!     → matcher.rs (`*`, `/prefix/*`, per-segment glob, exact)
//! ```
//!
//! # Design Decisions
//! - Route table swapped atomically on reload, never mutated in place
//! - No regex in hot path
//! - Deterministic: same input always matches same route

pub mod matcher;
pub mod router;

pub use matcher::{any_route_matches, route_matches};
pub use router::{RouteTable, ServiceRoute, TargetSpec};
