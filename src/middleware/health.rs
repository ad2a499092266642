//! Periodic middleware health classification.
//!
//! # Responsibilities
//! - Run one periodic check task per registered entry
//! - Classify entries as healthy, degraded or unhealthy from live metrics
//! - Alert when an entry becomes unhealthy
//!
//! # Design Decisions
//! - Error rate and average latency are computed over the invocations since
//!   the previous check of the same entry (the trailing window)
//! - Recovery is not decided here: the next successful live invocation marks
//!   the entry healthy again
//! - The task set is reconciled against the chain on every monitor tick, so
//!   entries registered later are picked up without restarting anything

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::config::schema::MiddlewareHealthConfig;
use crate::health::alerts::{Alert, AlertKind, AlertManager};
use crate::middleware::chain::MiddlewareChain;
use crate::middleware::entry::MiddlewareEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum MiddlewareHealth {
    Healthy = 0,
    Degraded = 1,
    Unhealthy = 2,
}

impl MiddlewareHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            MiddlewareHealth::Healthy => "healthy",
            MiddlewareHealth::Degraded => "degraded",
            MiddlewareHealth::Unhealthy => "unhealthy",
        }
    }
}

impl From<u8> for MiddlewareHealth {
    fn from(value: u8) -> Self {
        match value {
            0 => MiddlewareHealth::Healthy,
            1 => MiddlewareHealth::Degraded,
            _ => MiddlewareHealth::Unhealthy,
        }
    }
}

impl std::fmt::Display for MiddlewareHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub error_rate_threshold: f64,
    pub latency_threshold: Duration,
    pub unhealthy_after: u64,
}

impl From<&MiddlewareHealthConfig> for MonitorSettings {
    fn from(config: &MiddlewareHealthConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs.max(1)),
            error_rate_threshold: config.error_rate_threshold,
            latency_threshold: Duration::from_millis(config.latency_threshold_ms),
            unhealthy_after: config.unhealthy_consecutive_failures.max(1),
        }
    }
}

/// Counters seen at the previous check.
#[derive(Debug, Default, Clone, Copy)]
struct Baseline {
    total: u64,
    failed: u64,
    latency_sum: Duration,
}

pub struct HealthMonitor {
    chain: Arc<MiddlewareChain>,
    alerts: Arc<AlertManager>,
    settings: MonitorSettings,
    baselines: Mutex<HashMap<String, Baseline>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(chain: Arc<MiddlewareChain>, alerts: Arc<AlertManager>, settings: MonitorSettings) -> Self {
        Self {
            chain,
            alerts,
            settings,
            baselines: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Reconcile per-entry tasks on every interval until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sync(),
                _ = shutdown.recv() => break,
            }
        }
        self.stop();
        tracing::info!("Middleware health monitor stopped");
    }

    /// Start tasks for new entries and stop tasks of unregistered ones.
    pub fn sync(self: &Arc<Self>) {
        let entries = self.chain.entries();
        let mut tasks = self.tasks.lock();

        tasks.retain(|name, handle| {
            let keep = entries.iter().any(|e| e.name() == name);
            if !keep {
                handle.abort();
                self.baselines.lock().remove(name);
            }
            keep
        });

        for entry in entries.iter() {
            if tasks.contains_key(entry.name()) {
                continue;
            }
            tracing::debug!(middleware = %entry.name(), "Starting middleware health checks");
            let monitor = Arc::clone(self);
            let name = entry.name().to_string();
            let handle = tokio::spawn({
                let name = name.clone();
                async move { monitor.watch(name).await }
            });
            tasks.insert(name, handle);
        }
    }

    async fn watch(&self, name: String) {
        let mut ticker = time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.check(&name);
        }
    }

    /// Classify one entry now. Returns the new status on a transition.
    pub fn check(&self, name: &str) -> Option<MiddlewareHealth> {
        let entry = self.chain.get(name)?;
        let metrics = entry.metrics();

        let window = {
            let mut baselines = self.baselines.lock();
            let previous = baselines.insert(
                name.to_string(),
                Baseline {
                    total: metrics.total,
                    failed: metrics.failed,
                    latency_sum: metrics.latency_sum,
                },
            );
            let previous = previous.unwrap_or_default();
            Baseline {
                total: metrics.total.saturating_sub(previous.total),
                failed: metrics.failed.saturating_sub(previous.failed),
                latency_sum: metrics.latency_sum.saturating_sub(previous.latency_sum),
            }
        };

        let current = entry.health();
        let next = if metrics.consecutive_failures >= self.settings.unhealthy_after {
            MiddlewareHealth::Unhealthy
        } else if current == MiddlewareHealth::Healthy && self.is_degraded(&window) {
            MiddlewareHealth::Degraded
        } else {
            return None;
        };

        if next == current {
            return None;
        }
        self.transition(&entry, current, next, &window, metrics.consecutive_failures);
        Some(next)
    }

    fn is_degraded(&self, window: &Baseline) -> bool {
        if window.total == 0 {
            return false;
        }
        let error_rate = window.failed as f64 / window.total as f64;
        let avg_latency = Duration::from_nanos((window.latency_sum.as_nanos() / u128::from(window.total)) as u64);
        error_rate > self.settings.error_rate_threshold || avg_latency > self.settings.latency_threshold
    }

    fn transition(
        &self,
        entry: &MiddlewareEntry,
        from: MiddlewareHealth,
        to: MiddlewareHealth,
        window: &Baseline,
        consecutive: u64,
    ) {
        entry.set_health(to);
        tracing::warn!(
            middleware = %entry.name(),
            from = %from,
            to = %to,
            window_total = window.total,
            window_failed = window.failed,
            consecutive_failures = consecutive,
            "Middleware health changed"
        );

        if to == MiddlewareHealth::Unhealthy {
            self.alerts.emit(
                Alert::new(
                    AlertKind::MiddlewareUnhealthy,
                    entry.name(),
                    format!(
                        "middleware {} is unhealthy after {consecutive} consecutive failures",
                        entry.name()
                    ),
                )
                .with_meta("consecutive_failures", consecutive),
            );
        }
    }

    /// Classify every entry now.
    pub fn check_all(&self) -> Vec<(String, MiddlewareHealth)> {
        self.chain
            .entries()
            .iter()
            .filter_map(|e| self.check(e.name()).map(|h| (e.name().to_string(), h)))
            .collect()
    }

    pub fn watched(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn stop(&self) {
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
    }
}
