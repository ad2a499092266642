//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Route matched → service identified
//!     → pool.rs (service pool, healthy targets only)
//!     → Apply load balancing strategy:
//!         - round_robin.rs (rotating cursor per service)
//!         - random.rs (uniform pick)
//!         - weighted.rs (pick proportional to weight)
//!     → Return target or UpstreamUnavailable
//! ```
//!
//! # Design Decisions
//! - Strategies only see healthy targets; the pool filters first
//! - No fallback to unhealthy targets
//! - Target health is shared per address across services and reloads

pub mod backend;
pub mod pool;
pub mod random;
pub mod round_robin;
pub mod weighted;

use std::fmt::Debug;
use std::sync::Arc;

use crate::config::schema::LoadBalancing;

pub use backend::{HealthThresholds, Target, TargetHealth, TargetStatus};
pub use pool::{ServicePool, TargetPools, WeightedTarget};

/// A target selection strategy.
pub trait LoadBalancer: Send + Sync + Debug {
    /// Pick one of `candidates`, which are all healthy.
    fn next_target(&self, candidates: &[WeightedTarget]) -> Option<Arc<Target>>;
}

/// Build the strategy configured for a service.
pub fn strategy_for(kind: LoadBalancing) -> Box<dyn LoadBalancer> {
    match kind {
        LoadBalancing::RoundRobin => Box::new(round_robin::RoundRobin::new()),
        LoadBalancing::Random => Box::new(random::Random),
        LoadBalancing::Weighted => Box::new(weighted::Weighted),
    }
}
