//! Service pool management.
//!
//! # Responsibilities
//! - Group targets per service and apply the service's strategy
//! - Keep one shared `Target` per address so health survives reloads
//! - Provide the set of targets the health checker must watch

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::error::GatewayError;
use crate::load_balancer::{backend::Target, strategy_for, LoadBalancer};
use crate::routing::ServiceRoute;

/// A target together with its weight inside one service.
#[derive(Debug, Clone)]
pub struct WeightedTarget {
    pub target: Arc<Target>,
    pub weight: u32,
}

/// The targets of one service plus its selection strategy.
#[derive(Debug)]
pub struct ServicePool {
    service: String,
    members: Vec<WeightedTarget>,
    balancer: Box<dyn LoadBalancer>,
}

impl ServicePool {
    pub fn new(service: impl Into<String>, members: Vec<WeightedTarget>, balancer: Box<dyn LoadBalancer>) -> Self {
        Self {
            service: service.into(),
            members,
            balancer,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn members(&self) -> &[WeightedTarget] {
        &self.members
    }

    /// Members currently marked healthy, in declaration order.
    pub fn healthy(&self) -> Vec<WeightedTarget> {
        self.members
            .iter()
            .filter(|m| m.target.is_healthy())
            .cloned()
            .collect()
    }

    /// Select a healthy target, never falling back to an unhealthy one.
    pub fn select(&self) -> Result<Arc<Target>, GatewayError> {
        let healthy = self.healthy();
        self.balancer.next_target(&healthy).ok_or_else(|| {
            tracing::debug!(
                service = %self.service,
                targets = self.members.len(),
                "No healthy target available"
            );
            GatewayError::UpstreamUnavailable(self.service.clone())
        })
    }
}

/// All service pools, rebuilt whenever routes are reloaded.
#[derive(Debug, Default)]
pub struct TargetPools {
    pools: ArcSwap<HashMap<String, Arc<ServicePool>>>,
    targets: DashMap<String, Arc<Target>>,
}

impl TargetPools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild every pool from `routes`.
    ///
    /// Targets whose address is still referenced keep their health state;
    /// targets no longer referenced are dropped. Returns the live target set.
    pub fn rebuild(&self, routes: &[Arc<ServiceRoute>]) -> Vec<Arc<Target>> {
        let mut pools = HashMap::with_capacity(routes.len());
        let mut live: HashMap<String, Arc<Target>> = HashMap::new();

        for route in routes {
            let mut members = Vec::with_capacity(route.targets.len());
            for spec in &route.targets {
                let target = match self.resolve_target(&spec.address) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!(
                            service = %route.name,
                            address = %spec.address,
                            error = %e,
                            "Invalid target address"
                        );
                        continue;
                    }
                };
                live.insert(target.address.clone(), target.clone());
                members.push(WeightedTarget {
                    target,
                    weight: spec.weight,
                });
            }

            pools.insert(
                route.name.clone(),
                Arc::new(ServicePool::new(
                    route.name.clone(),
                    members,
                    strategy_for(route.strategy),
                )),
            );
        }

        self.targets.retain(|address, _| live.contains_key(address));
        self.pools.store(Arc::new(pools));
        live.into_values().collect()
    }

    fn resolve_target(&self, address: &str) -> Result<Arc<Target>, url::ParseError> {
        let candidate = Target::new(address)?;
        Ok(self
            .targets
            .entry(candidate.address.clone())
            .or_insert_with(|| Arc::new(candidate))
            .clone())
    }

    pub fn pool(&self, service: &str) -> Option<Arc<ServicePool>> {
        self.pools.load().get(service).cloned()
    }

    pub fn target(&self, address: &str) -> Option<Arc<Target>> {
        self.targets.get(address).map(|t| t.clone())
    }

    /// Every known target, sorted by address.
    pub fn targets(&self) -> Vec<Arc<Target>> {
        let mut all: Vec<_> = self.targets.iter().map(|t| t.value().clone()).collect();
        all.sort_by(|a, b| a.address.cmp(&b.address));
        all
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::schema::LoadBalancing;
    use crate::load_balancer::backend::HealthThresholds;
    use crate::routing::TargetSpec;

    pub(crate) fn weighted(address: &str, weight: u32) -> WeightedTarget {
        WeightedTarget {
            target: Arc::new(Target::new(address).unwrap()),
            weight,
        }
    }

    fn route(name: &str, addresses: &[&str]) -> Arc<ServiceRoute> {
        Arc::new(ServiceRoute {
            name: name.into(),
            path_prefix: format!("/{name}"),
            targets: addresses
                .iter()
                .map(|a| TargetSpec {
                    address: a.to_string(),
                    weight: 1,
                })
                .collect(),
            timeout: Duration::from_secs(1),
            retry_count: 0,
            strategy: LoadBalancing::RoundRobin,
            strip_prefix: false,
        })
    }

    fn mark_down(target: &Target) {
        let thresholds = HealthThresholds {
            healthy: 1,
            unhealthy: 1,
        };
        target.record_check(false, Duration::from_millis(1), thresholds);
    }

    #[test]
    fn test_select_skips_unhealthy() {
        let pools = TargetPools::new();
        pools.rebuild(&[route("users", &["127.0.0.1:9001", "127.0.0.1:9002"])]);
        mark_down(&pools.target("127.0.0.1:9001").unwrap());

        let pool = pools.pool("users").unwrap();
        for _ in 0..5 {
            assert_eq!(pool.select().unwrap().address, "127.0.0.1:9002");
        }
    }

    #[test]
    fn test_no_healthy_target_is_unavailable() {
        let pools = TargetPools::new();
        pools.rebuild(&[route("users", &["127.0.0.1:9001"])]);
        mark_down(&pools.target("127.0.0.1:9001").unwrap());

        let err = pools.pool("users").unwrap().select().unwrap_err();
        assert_eq!(err, GatewayError::UpstreamUnavailable("users".into()));
    }

    #[test]
    fn test_rebuild_preserves_health_and_drops_stale() {
        let pools = TargetPools::new();
        pools.rebuild(&[route("users", &["127.0.0.1:9001", "127.0.0.1:9002"])]);
        mark_down(&pools.target("127.0.0.1:9001").unwrap());

        let live = pools.rebuild(&[
            route("users", &["127.0.0.1:9001"]),
            route("orders", &["http://127.0.0.1:9001"]),
        ]);

        assert_eq!(live.len(), 1);
        assert!(!pools.target("127.0.0.1:9001").unwrap().is_healthy());
        assert!(pools.target("127.0.0.1:9002").is_none());
        // Both services share the same target state.
        assert!(pools.pool("orders").unwrap().select().is_err());
    }
}
