//! Retry logic.
//!
//! # Responsibilities
//! - Determine if a request is retryable (idempotent methods only)
//! - Classify upstream outcomes as retryable failures
//! - Enforce a retry budget (retries as a share of requests)
//!
//! # Design Decisions
//! - Never retry non-idempotent methods (POST, PATCH)
//! - Transport errors, timeouts and 502/503/504 are retryable
//! - The budget is counted per time window so old traffic does not earn
//!   unlimited retries

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::http::{Method, StatusCode};

use crate::config::schema::RetryConfig;

/// Whether an upstream status counts as a failed call.
pub fn is_failure_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Whether a request may be sent again after the given outcome.
///
/// `status` is the upstream status, `None` for transport errors and timeouts.
pub fn is_retryable(method: &Method, status: Option<StatusCode>) -> bool {
    if !method.is_idempotent() {
        return false;
    }
    match status {
        None => true,
        Some(s) => is_failure_status(s),
    }
}

const BUDGET_WINDOW: Duration = Duration::from_secs(10);

/// Caps retries at `min_retries + ratio * requests` per window.
#[derive(Debug)]
pub struct RetryBudget {
    ratio: f64,
    min_retries: u64,
    epoch: Instant,
    window_start_ms: AtomicU64,
    requests: AtomicU64,
    retries: AtomicU64,
}

impl RetryBudget {
    pub fn new(ratio: f32, min_retries: u64) -> Self {
        Self {
            ratio: f64::from(ratio.clamp(0.0, 1.0)),
            min_retries,
            epoch: Instant::now(),
            window_start_ms: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.budget_ratio, config.budget_min_retries)
    }

    fn roll_window(&self) {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let start = self.window_start_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(start) > BUDGET_WINDOW.as_millis() as u64
            && self
                .window_start_ms
                .compare_exchange(start, now_ms, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.requests.store(0, Ordering::Release);
            self.retries.store(0, Ordering::Release);
        }
    }

    pub fn record_request(&self) {
        self.roll_window();
        self.requests.fetch_add(1, Ordering::AcqRel);
    }

    /// Reserve one retry; false when the budget is exhausted.
    pub fn try_retry(&self) -> bool {
        self.roll_window();
        let requests = self.requests.load(Ordering::Acquire) as f64;
        let allowed = self.min_retries + (requests * self.ratio) as u64;
        self.retries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| (r < allowed).then_some(r + 1))
            .is_ok()
    }
}
