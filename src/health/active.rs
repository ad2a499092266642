//! Active health checking.
//!
//! # Responsibilities
//! - Run one independent periodic check task per target
//! - Bound every check with its own timeout, separate from request timeouts
//! - Apply results to target health and alert on transitions

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use futures_util::future::BoxFuture;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::schema::HealthCheckConfig;
use crate::health::alerts::{Alert, AlertKind, AlertManager};
use crate::load_balancer::backend::{HealthThresholds, Target, TargetHealth};
use crate::observability::metrics;

/// Performs a single check against a target.
pub trait HealthProbe: Send + Sync {
    /// `Ok` when the target passed, `Err(reason)` otherwise.
    fn probe<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, Result<(), String>>;
}

/// HTTP GET probe against a fixed path.
pub struct HttpProbe {
    client: Client<HttpConnector, Body>,
    path: String,
    expected_status: Vec<u16>,
}

impl HttpProbe {
    pub fn new(path: impl Into<String>, expected_status: Vec<u16>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            client,
            path: path.into(),
            expected_status,
        }
    }

    pub fn from_config(config: &HealthCheckConfig) -> Self {
        Self::new(config.path.clone(), config.expected_status.clone())
    }
}

impl HealthProbe for HttpProbe {
    fn probe<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, Result<(), String>> {
        Box::pin(async move {
            let uri = format!("http://{}{}", target.address, self.path);
            let request = Request::builder()
                .method("GET")
                .uri(uri)
                .header("user-agent", "api-gateway-health-check")
                .body(Body::empty())
                .map_err(|e| format!("invalid health check request: {e}"))?;

            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| format!("connection error: {e}"))?;

            let status = response.status().as_u16();
            if self.expected_status.contains(&status) {
                Ok(())
            } else {
                Err(format!("unexpected status {status}"))
            }
        })
    }
}

/// Check cadence and thresholds.
#[derive(Debug, Clone, Copy)]
pub struct CheckSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub thresholds: HealthThresholds,
}

impl From<&HealthCheckConfig> for CheckSettings {
    fn from(config: &HealthCheckConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs.max(1)),
            timeout: Duration::from_millis(config.timeout_ms),
            thresholds: HealthThresholds {
                healthy: config.healthy_threshold.max(1),
                unhealthy: config.unhealthy_threshold.max(1),
            },
        }
    }
}

/// Owns the per-target check tasks.
pub struct HealthChecker {
    probe: Arc<dyn HealthProbe>,
    settings: CheckSettings,
    alerts: Arc<AlertManager>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl HealthChecker {
    pub fn new(probe: Arc<dyn HealthProbe>, settings: CheckSettings, alerts: Arc<AlertManager>) -> Self {
        Self {
            probe,
            settings,
            alerts,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start tasks for new targets and stop tasks of targets that are gone.
    pub fn sync(self: &Arc<Self>, targets: &[Arc<Target>]) {
        let mut tasks = self.tasks.lock();

        tasks.retain(|address, handle| {
            let keep = targets.iter().any(|t| &t.address == address);
            if !keep {
                tracing::info!(target_addr = %address, "Stopping health checks");
                handle.abort();
            }
            keep
        });

        for target in targets {
            if tasks.contains_key(&target.address) {
                continue;
            }
            tracing::info!(
                target_addr = %target.address,
                interval = ?self.settings.interval,
                "Starting health checks"
            );
            let checker = Arc::clone(self);
            let target = Arc::clone(target);
            let address = target.address.clone();
            let handle = tokio::spawn(async move { checker.watch(target).await });
            tasks.insert(address, handle);
        }
    }

    async fn watch(&self, target: Arc<Target>) {
        let mut ticker = time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.check(&target).await;
        }
    }

    /// Run one check now. Returns the new state on a transition.
    pub async fn check(&self, target: &Target) -> Option<TargetHealth> {
        let started = Instant::now();
        let outcome = match time::timeout(self.settings.timeout, self.probe.probe(target)).await {
            Ok(result) => result,
            Err(_) => Err(format!("timed out after {:?}", self.settings.timeout)),
        };
        let latency = started.elapsed();

        if let Err(reason) = &outcome {
            tracing::debug!(target_addr = %target.address, reason = %reason, "Health check failed");
        }

        let transition = target.record_check(outcome.is_ok(), latency, self.settings.thresholds);
        metrics::record_target_health(&target.address, target.is_healthy());

        match transition {
            Some(TargetHealth::Unhealthy) => {
                tracing::warn!(target_addr = %target.address, "Target marked unhealthy");
                let reason = outcome.err().unwrap_or_default();
                self.alerts.emit(
                    Alert::new(
                        AlertKind::TargetDown,
                        &target.address,
                        format!("target {} is unhealthy: {reason}", target.address),
                    )
                    .with_meta("consecutive_failures", self.settings.thresholds.unhealthy),
                );
            }
            Some(TargetHealth::Healthy) => {
                tracing::info!(target_addr = %target.address, "Target recovered");
                self.alerts.emit(Alert::new(
                    AlertKind::TargetRecovered,
                    &target.address,
                    format!("target {} is healthy again", target.address),
                ));
            }
            None => {}
        }
        transition
    }

    pub fn watched(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Abort every check task.
    pub fn stop(&self) {
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
    }
}
