//! Per-middleware invocation metrics.

use std::time::Duration;

use serde::Serialize;

use crate::health::alerts::unix_millis;

/// Running counters for one entry. Guarded by the entry's mutex, so every
/// update is applied as a unit.
#[derive(Debug, Default, Clone)]
pub struct MetricsRecorder {
    total: u64,
    failed: u64,
    consecutive_failures: u64,
    min_latency: Option<Duration>,
    max_latency: Duration,
    latency_sum: Duration,
    last_error: Option<String>,
    last_error_at: Option<u64>,
}

/// Point-in-time copy of an entry's metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub failed: u64,
    pub consecutive_failures: u64,
    pub error_rate: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub avg_latency_ms: f64,
    #[serde(skip)]
    pub latency_sum: Duration,
    pub last_error: Option<String>,
    /// Unix time in milliseconds.
    pub last_error_at: Option<u64>,
}

impl MetricsRecorder {
    fn record(&mut self, latency: Duration) {
        self.total += 1;
        self.latency_sum += latency;
        self.max_latency = self.max_latency.max(latency);
        self.min_latency = Some(self.min_latency.map_or(latency, |m| m.min(latency)));
    }

    pub fn record_success(&mut self, latency: Duration) {
        self.record(latency);
        self.consecutive_failures = 0;
    }

    /// Returns the consecutive-failure count including this one.
    pub fn record_failure(&mut self, latency: Duration, error: &str) -> u64 {
        self.record(latency);
        self.failed += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error.to_string());
        self.last_error_at = Some(unix_millis());
        self.consecutive_failures
    }

    pub fn reset_consecutive_failures(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let avg = if self.total > 0 {
            Duration::from_nanos((self.latency_sum.as_nanos() / u128::from(self.total)) as u64)
        } else {
            Duration::ZERO
        };
        MetricsSnapshot {
            total: self.total,
            failed: self.failed,
            consecutive_failures: self.consecutive_failures,
            error_rate: if self.total > 0 {
                self.failed as f64 / self.total as f64
            } else {
                0.0
            },
            min_latency_ms: millis(self.min_latency.unwrap_or_default()),
            max_latency_ms: millis(self.max_latency),
            avg_latency_ms: millis(avg),
            latency_sum: self.latency_sum,
            last_error: self.last_error.clone(),
            last_error_at: self.last_error_at,
        }
    }
}

fn millis(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}
