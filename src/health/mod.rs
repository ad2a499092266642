//! Target health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     One periodic task per target
//!     → Probe with its own timeout
//!     → Target::record_check (consecutive pass/fail thresholds)
//!     → On transition: alerts.rs
//!
//! Alerts (alerts.rs):
//!     Alert → throttle per (kind, subject) → log / webhook / recent history
//! ```
//!
//! # Design Decisions
//! - State transitions require consecutive successes/failures
//! - Health state is per-target, shared by every service using the address
//! - Check timeouts are independent from request-path timeouts

pub mod active;
pub mod alerts;

pub use active::{CheckSettings, HealthChecker, HealthProbe, HttpProbe};
pub use alerts::{Alert, AlertKind, AlertManager, AlertSink, RecentAlerts};
