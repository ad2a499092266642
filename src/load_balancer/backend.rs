//! Backend target abstraction.
//!
//! # Responsibilities
//! - Represent a single backend endpoint
//! - Track health state (Healthy/Unhealthy) and consecutive check results
//! - Track a rolling average of check latency
//!
//! # Design Decisions
//! - Only the active health checker mutates health; the balancer and
//!   forwarder only read it
//! - New targets start healthy so traffic flows before the first check

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use serde::Serialize;
use url::Url;

/// Target health state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetHealth {
    Healthy = 0,
    Unhealthy = 1,
}

impl From<u8> for TargetHealth {
    fn from(val: u8) -> Self {
        match val {
            0 => TargetHealth::Healthy,
            _ => TargetHealth::Unhealthy,
        }
    }
}

/// Consecutive-result thresholds for health transitions.
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub healthy: u32,
    pub unhealthy: u32,
}

/// A single backend endpoint.
#[derive(Debug)]
pub struct Target {
    /// `host:port`, used as the identity of the target.
    pub address: String,
    /// Base URL requests are forwarded to.
    pub base_url: Url,

    health: AtomicU8,
    consecutive_passes: AtomicU32,
    consecutive_fails: AtomicU32,
    /// Rolling average check latency in microseconds (0 = no sample yet).
    avg_latency_us: AtomicU64,
}

/// Read-only view of a target for admin/reporting.
#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    pub address: String,
    pub health: TargetHealth,
    pub consecutive_passes: u32,
    pub consecutive_fails: u32,
    pub avg_latency_ms: f64,
}

impl Target {
    /// Create a target from `host:port` or an `http://host:port` URL.
    pub fn new(address: &str) -> Result<Self, url::ParseError> {
        let base_url = parse_target_url(address)?;
        let host = base_url.host_str().ok_or(url::ParseError::EmptyHost)?;
        let port = base_url.port_or_known_default().unwrap_or(80);

        Ok(Self {
            address: format!("{host}:{port}"),
            base_url,
            health: AtomicU8::new(TargetHealth::Healthy as u8),
            consecutive_passes: AtomicU32::new(0),
            consecutive_fails: AtomicU32::new(0),
            avg_latency_us: AtomicU64::new(0),
        })
    }

    pub fn health(&self) -> TargetHealth {
        TargetHealth::from(self.health.load(Ordering::Acquire))
    }

    pub fn is_healthy(&self) -> bool {
        self.health() == TargetHealth::Healthy
    }

    pub fn avg_latency(&self) -> Duration {
        Duration::from_micros(self.avg_latency_us.load(Ordering::Relaxed))
    }

    /// Apply one health check result.
    ///
    /// Returns the new state when this check caused a transition.
    pub fn record_check(
        &self,
        passed: bool,
        latency: Duration,
        thresholds: HealthThresholds,
    ) -> Option<TargetHealth> {
        self.update_latency(latency);

        if passed {
            self.consecutive_fails.store(0, Ordering::Relaxed);
            let passes = self.consecutive_passes.fetch_add(1, Ordering::Relaxed) + 1;
            if !self.is_healthy() && passes >= thresholds.healthy {
                self.health
                    .store(TargetHealth::Healthy as u8, Ordering::Release);
                return Some(TargetHealth::Healthy);
            }
        } else {
            self.consecutive_passes.store(0, Ordering::Relaxed);
            let fails = self.consecutive_fails.fetch_add(1, Ordering::Relaxed) + 1;
            if self.is_healthy() && fails >= thresholds.unhealthy {
                self.health
                    .store(TargetHealth::Unhealthy as u8, Ordering::Release);
                return Some(TargetHealth::Unhealthy);
            }
        }
        None
    }

    fn update_latency(&self, latency: Duration) {
        let sample = latency.as_micros().min(u64::MAX as u128) as u64;
        let prev = self.avg_latency_us.load(Ordering::Relaxed);
        // EWMA with alpha = 1/5.
        let next = if prev == 0 {
            sample
        } else {
            (prev * 4 + sample) / 5
        };
        self.avg_latency_us.store(next.max(1), Ordering::Relaxed);
    }

    pub fn status(&self) -> TargetStatus {
        TargetStatus {
            address: self.address.clone(),
            health: self.health(),
            consecutive_passes: self.consecutive_passes.load(Ordering::Relaxed),
            consecutive_fails: self.consecutive_fails.load(Ordering::Relaxed),
            avg_latency_ms: self.avg_latency().as_secs_f64() * 1000.0,
        }
    }
}

/// Parse a configured target address into a base URL.
pub fn parse_target_url(address: &str) -> Result<Url, url::ParseError> {
    if address.contains("://") {
        Url::parse(address)
    } else {
        Url::parse(&format!("http://{address}"))
    }
}
