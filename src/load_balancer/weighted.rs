//! Weighted random load balancing strategy.

use std::sync::Arc;

use rand::distributions::{Distribution, WeightedIndex};

use crate::load_balancer::{backend::Target, LoadBalancer, WeightedTarget};

/// Picks a target with probability proportional to its weight.
#[derive(Debug, Default)]
pub struct Weighted;

impl LoadBalancer for Weighted {
    fn next_target(&self, candidates: &[WeightedTarget]) -> Option<Arc<Target>> {
        let dist = WeightedIndex::new(candidates.iter().map(|c| c.weight)).ok()?;
        let index = dist.sample(&mut rand::thread_rng());
        Some(candidates[index].target.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::pool::tests::weighted;

    #[test]
    fn test_weights_are_respected() {
        let candidates = vec![weighted("127.0.0.1:8080", 9), weighted("127.0.0.1:8081", 1)];
        let heavy = (0..2000)
            .filter(|_| Weighted.next_target(&candidates).unwrap().address == "127.0.0.1:8080")
            .count();
        assert!(heavy > 1500, "heavy target picked {heavy} times");
    }

    #[test]
    fn test_zero_weights_pick_nothing() {
        let candidates = vec![weighted("127.0.0.1:8080", 0)];
        assert!(Weighted.next_target(&candidates).is_none());
        assert!(Weighted.next_target(&[]).is_none());
    }
}
