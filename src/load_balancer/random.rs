//! Uniform random load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{backend::Target, LoadBalancer, WeightedTarget};

#[derive(Debug, Default)]
pub struct Random;

impl LoadBalancer for Random {
    fn next_target(&self, candidates: &[WeightedTarget]) -> Option<Arc<Target>> {
        if candidates.is_empty() {
            return None;
        }
        Some(candidates[fastrand::usize(..candidates.len())].target.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::pool::tests::weighted;

    #[test]
    fn test_random_covers_all_candidates() {
        let candidates = vec![weighted("127.0.0.1:8080", 1), weighted("127.0.0.1:8081", 1)];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(Random.next_target(&candidates).unwrap().address.clone());
        }
        assert_eq!(seen.len(), 2);
    }
}
