//! Dynamic middleware chain.
//!
//! # Data Flow
//! ```text
//! Definitions (config / admin)
//!     → resolver.rs: kind → Arc<dyn Middleware>
//!     → chain.rs: register / update / unregister, sorted index via ArcSwap
//!
//! Per request:
//!     chain.build_pipeline(phase, path) → pipeline.rs
//!     → nested continuations → terminal (forwarder)
//!     → failures recorded on the originating entry (metrics.rs)
//!     → rollback.rs notified; auto-rollback at the failure threshold
//!
//! Background:
//!     health.rs classifies entries from their metrics
//!     testing.rs runs one entry in a sandbox on demand
//! ```
//!
//! # Design Decisions
//! - Handlers are trait objects; how they were produced is not the chain's concern
//! - Built pipelines are detached copies; registration changes never affect
//!   requests already in flight
//! - Snapshot history is a fixed-capacity ring per entry

pub mod builtin;
pub mod chain;
pub mod entry;
pub mod handler;
pub mod health;
pub mod metrics;
pub mod pipeline;
pub mod resolver;
pub mod rollback;
pub mod snapshot;
pub mod testing;

pub use chain::MiddlewareChain;
pub use entry::{EntryView, MiddlewareEntry, MiddlewareSettings, Phase};
pub use handler::{Exchange, Middleware, MiddlewareError, Passthrough, Terminal};
pub use health::{HealthMonitor, MiddlewareHealth, MonitorSettings};
pub use metrics::MetricsSnapshot;
pub use pipeline::{FailureListener, Next, Pipeline};
pub use resolver::{BuiltinResolver, ChainLoader, HandlerResolver, ResolveError};
pub use rollback::RollbackManager;
pub use snapshot::{Snapshot, SNAPSHOT_CAPACITY};
pub use testing::{MiddlewareTester, SyntheticRequest, TestReport};
