//! Token-bucket admission control.
//!
//! # Responsibilities
//! - One lazily refilled bucket per admission key (client IP or API key)
//! - Reject over-limit requests with a retry-after hint
//! - Run as an axum layer in front of routing
//!
//! # Design Decisions
//! - No background refill: the bucket level is derived from time at check
//! - Each bucket is a single `AtomicU64` holding the instant at which the
//!   bucket is full again; a check is one compare-and-set, never a lock
//! - Buckets are created on first use and kept for the key's lifetime

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;

use crate::config::schema::{RateLimitConfig, RateLimitKey};
use crate::error::GatewayError;
use crate::observability::metrics;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Per-key bucket state.
///
/// `full_at_ns` is the time (relative to the limiter epoch) at which the
/// bucket will be back at capacity. The token level at `now` is
/// `capacity - max(0, full_at - now) * refill_rate`.
#[derive(Debug, Default)]
pub struct TokenBucket {
    full_at_ns: AtomicU64,
}

/// Per-key token-bucket rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    key_source: RateLimitKey,
    epoch: Instant,
    buckets: DashMap<String, Arc<TokenBucket>>,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self::with_epoch(capacity, refill_per_sec, Instant::now())
    }

    /// Create a limiter whose clock starts at `epoch`. Instants passed to the
    /// `*_at` methods must not precede it.
    pub fn with_epoch(capacity: u32, refill_per_sec: f64, epoch: Instant) -> Self {
        Self {
            capacity: f64::from(capacity.max(1)),
            refill_per_sec,
            key_source: RateLimitKey::Ip,
            epoch,
            buckets: DashMap::new(),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        let mut limiter = Self::new(config.capacity, config.refill_per_sec);
        limiter.key_source = config.key;
        limiter
    }

    fn nanos(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_nanos() as u64
    }

    fn tokens_to_ns(&self, tokens: f64) -> u64 {
        (tokens / self.refill_per_sec * NANOS_PER_SEC) as u64
    }

    fn bucket(&self, key: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return bucket.clone();
        }
        self.buckets.entry(key.to_string()).or_default().clone()
    }

    /// Take `cost` tokens from `key`'s bucket.
    pub fn check(&self, key: &str, cost: u32) -> Result<(), GatewayError> {
        self.check_at(key, cost, Instant::now())
    }

    pub fn check_at(&self, key: &str, cost: u32, now: Instant) -> Result<(), GatewayError> {
        let bucket = self.bucket(key);
        let now_ns = self.nanos(now);
        let cost_ns = self.tokens_to_ns(f64::from(cost));
        let capacity_ns = self.tokens_to_ns(self.capacity);

        let mut current = bucket.full_at_ns.load(Ordering::Acquire);
        loop {
            let deficit_ns = current.saturating_sub(now_ns);
            let needed_ns = deficit_ns.saturating_add(cost_ns);
            if needed_ns > capacity_ns {
                return Err(GatewayError::RateLimitExceeded {
                    key: key.to_string(),
                    retry_after: Duration::from_nanos(needed_ns - capacity_ns),
                });
            }

            match bucket.full_at_ns.compare_exchange_weak(
                current,
                now_ns.saturating_add(needed_ns),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Tokens currently available for `key`.
    pub fn tokens_at(&self, key: &str, now: Instant) -> f64 {
        let Some(bucket) = self.buckets.get(key) else {
            return self.capacity;
        };
        let deficit_ns = bucket
            .full_at_ns
            .load(Ordering::Acquire)
            .saturating_sub(self.nanos(now));
        self.capacity - deficit_ns as f64 / NANOS_PER_SEC * self.refill_per_sec
    }

    /// Derive the admission key for a request.
    pub fn key_for(&self, request: &Request<Body>, client: SocketAddr) -> String {
        if self.key_source == RateLimitKey::ApiKey {
            if let Some(api_key) = request
                .headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
            {
                return format!("key:{api_key}");
            }
        }
        format!("ip:{}", client.ip())
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

/// Axum middleware applying admission control before routing.
pub async fn rate_limit_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let key = limiter.key_for(&request, addr);

    match limiter.check(&key, 1) {
        Ok(()) => next.run(request).await,
        Err(err) => {
            tracing::warn!(client = %key, "Rate limit exceeded");
            metrics::record_rate_limited();
            err.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_refill() {
        let t0 = Instant::now();
        let limiter = RateLimiter::with_epoch(10, 1.0, t0);

        for _ in 0..10 {
            assert!(limiter.check_at("ip:1.2.3.4", 1, t0).is_ok());
        }

        match limiter.check_at("ip:1.2.3.4", 1, t0) {
            Err(GatewayError::RateLimitExceeded { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_secs(1));
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        let later = t0 + Duration::from_secs(1);
        assert!(limiter.check_at("ip:1.2.3.4", 1, later).is_ok());
        assert!(limiter.check_at("ip:1.2.3.4", 1, later).is_err());
    }

    #[test]
    fn test_oversized_cost_is_rejected_without_draining() {
        let t0 = Instant::now();
        let limiter = RateLimiter::with_epoch(10, 0.1, t0);
        assert!(limiter.check_at("k", 1, t0).is_ok());

        let soon = t0 + Duration::from_millis(5);
        assert!(matches!(
            limiter.check_at("k", u32::MAX, soon),
            Err(GatewayError::RateLimitExceeded { .. })
        ));
        assert!(limiter.check_at("k", 1, soon).is_ok());
    }

    #[test]
    fn test_keys_are_independent() {
        let t0 = Instant::now();
        let limiter = RateLimiter::with_epoch(1, 1.0, t0);
        assert!(limiter.check_at("a", 1, t0).is_ok());
        assert!(limiter.check_at("a", 1, t0).is_err());
        assert!(limiter.check_at("b", 1, t0).is_ok());
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let t0 = Instant::now();
        let limiter = RateLimiter::with_epoch(3, 10.0, t0);
        assert!(limiter.check_at("k", 3, t0).is_ok());

        let much_later = t0 + Duration::from_secs(60);
        assert_eq!(limiter.tokens_at("k", much_later), 3.0);
        assert!(limiter.check_at("k", 3, much_later).is_ok());
        assert!(limiter.check_at("k", 1, much_later).is_err());
    }

    #[test]
    fn test_cost_larger_than_capacity_reports_wait() {
        let t0 = Instant::now();
        let limiter = RateLimiter::with_epoch(2, 1.0, t0);
        let err = limiter.check_at("k", 2, t0).and_then(|_| limiter.check_at("k", 1, t0));
        assert!(matches!(err, Err(GatewayError::RateLimitExceeded { .. })));
        assert_eq!(err.unwrap_err().retry_after_secs(), Some(1));
    }

    #[test]
    fn test_concurrent_checks_never_overspend() {
        let t0 = Instant::now();
        let limiter = RateLimiter::with_epoch(100, 1.0, t0);
        let admitted: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| (0..50).filter(|_| limiter.check_at("k", 1, t0).is_ok()).count())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(admitted, 100);
    }
}
