//! Alert delivery.
//!
//! # Responsibilities
//! - Define the alert record emitted on target and middleware incidents
//! - Fan alerts out to the configured sinks
//! - Throttle repeats of the same alert kind for the same subject
//!
//! # Design Decisions
//! - `AlertSink::emit` is synchronous; sinks that do I/O spawn their own task
//! - Throttling uses `tokio::time::Instant` so it follows the runtime clock

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::schema::AlertConfig;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertKind {
    TargetDown,
    TargetRecovered,
    MiddlewareRolledBack,
    RollbackFailed,
    MiddlewareUnhealthy,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::TargetDown => "target-down",
            AlertKind::TargetRecovered => "target-recovered",
            AlertKind::MiddlewareRolledBack => "middleware-rolled-back",
            AlertKind::RollbackFailed => "rollback-failed",
            AlertKind::MiddlewareUnhealthy => "middleware-unhealthy",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            AlertKind::TargetRecovered => Severity::Info,
            AlertKind::MiddlewareRolledBack | AlertKind::MiddlewareUnhealthy => Severity::Warning,
            AlertKind::TargetDown | AlertKind::RollbackFailed => Severity::Critical,
        }
    }

    /// Whether repeats within the throttle window are suppressed. Rollback
    /// events are discrete and always delivered.
    pub fn is_throttled(self) -> bool {
        matches!(
            self,
            AlertKind::TargetDown | AlertKind::TargetRecovered | AlertKind::MiddlewareUnhealthy
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    /// Target address or middleware name.
    pub subject: String,
    pub message: String,
    /// Unix time in milliseconds.
    pub timestamp: u64,
    pub metadata: BTreeMap<String, String>,
}

impl Alert {
    pub fn new(kind: AlertKind, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            subject: subject.into(),
            message: message.into(),
            timestamp: unix_millis(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Destination for alerts.
pub trait AlertSink: Send + Sync {
    fn emit(&self, alert: &Alert);
}

/// Writes alerts to the log.
#[derive(Debug, Default)]
pub struct LogSink;

impl AlertSink for LogSink {
    fn emit(&self, alert: &Alert) {
        match alert.severity {
            Severity::Info => tracing::info!(
                kind = alert.kind.as_str(),
                subject = %alert.subject,
                "ALERT: {}", alert.message
            ),
            Severity::Warning => tracing::warn!(
                kind = alert.kind.as_str(),
                subject = %alert.subject,
                "ALERT: {}", alert.message
            ),
            Severity::Critical => tracing::error!(
                kind = alert.kind.as_str(),
                subject = %alert.subject,
                "ALERT: {}", alert.message
            ),
        }
    }
}

/// POSTs alerts as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

impl AlertSink for WebhookSink {
    fn emit(&self, alert: &Alert) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(url = %self.url, "No runtime available for webhook alert delivery");
            return;
        };
        let client = self.client.clone();
        let url = self.url.clone();
        let alert = alert.clone();
        runtime.spawn(async move {
            let result = client
                .post(&url)
                .timeout(Duration::from_secs(10))
                .json(&alert)
                .send()
                .await
                .and_then(|r| r.error_for_status());
            if let Err(e) = result {
                tracing::warn!(url = %url, error = %e, "Webhook alert delivery failed");
            }
        });
    }
}

/// Keeps the most recent alerts in memory for the admin surface.
#[derive(Debug)]
pub struct RecentAlerts {
    capacity: usize,
    alerts: Mutex<VecDeque<Alert>>,
}

impl RecentAlerts {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            alerts: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Oldest first.
    pub fn list(&self) -> Vec<Alert> {
        self.alerts.lock().iter().cloned().collect()
    }
}

impl AlertSink for RecentAlerts {
    fn emit(&self, alert: &Alert) {
        let mut alerts = self.alerts.lock();
        if alerts.len() == self.capacity {
            alerts.pop_front();
        }
        alerts.push_back(alert.clone());
    }
}

/// Fans alerts out to sinks, throttled per `(kind, subject)` for the kinds
/// that report ongoing conditions.
pub struct AlertManager {
    sinks: Vec<Arc<dyn AlertSink>>,
    throttle: Duration,
    last_sent: DashMap<(AlertKind, String), Instant>,
}

impl AlertManager {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>, throttle: Duration) -> Self {
        Self {
            sinks,
            throttle,
            last_sent: DashMap::new(),
        }
    }

    /// Log sink, in-memory history and an optional webhook.
    pub fn from_config(config: &AlertConfig, recent: Arc<RecentAlerts>) -> Self {
        let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogSink), recent];
        if let Some(url) = &config.webhook_url {
            sinks.push(Arc::new(WebhookSink::new(url.clone())));
        }
        Self::new(sinks, Duration::from_secs(config.throttle_secs))
    }

    /// Deliver `alert` unless it is a throttled kind already sent for the
    /// same subject within the throttle window. Returns whether it was delivered.
    pub fn emit(&self, alert: Alert) -> bool {
        if alert.kind.is_throttled() && self.recently_sent(&alert) {
            tracing::debug!(
                kind = alert.kind.as_str(),
                subject = %alert.subject,
                "Alert throttled"
            );
            return false;
        }

        metrics::record_alert(alert.kind.as_str());
        for sink in &self.sinks {
            sink.emit(&alert);
        }
        true
    }

    /// Check and stamp the last delivery time for the alert's kind and subject.
    fn recently_sent(&self, alert: &Alert) -> bool {
        let now = Instant::now();
        let key = (alert.kind, alert.subject.clone());

        match self.last_sent.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut last) => {
                if now.duration_since(*last.get()) < self.throttle {
                    true
                } else {
                    last.insert(now);
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(now);
                false
            }
        }
    }
}

impl std::fmt::Debug for AlertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertManager")
            .field("sinks", &self.sinks.len())
            .field("throttle", &self.throttle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(throttle: Duration) -> (AlertManager, Arc<RecentAlerts>) {
        let recent = Arc::new(RecentAlerts::new(10));
        (AlertManager::new(vec![recent.clone()], throttle), recent)
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_per_kind_and_subject() {
        let (alerts, recent) = manager(Duration::from_secs(300));

        assert!(alerts.emit(Alert::new(AlertKind::TargetDown, "a:1", "down")));
        assert!(!alerts.emit(Alert::new(AlertKind::TargetDown, "a:1", "down")));
        // Different subject or kind is not throttled.
        assert!(alerts.emit(Alert::new(AlertKind::TargetDown, "b:1", "down")));
        assert!(alerts.emit(Alert::new(AlertKind::TargetRecovered, "a:1", "up")));

        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(alerts.emit(Alert::new(AlertKind::TargetDown, "a:1", "down again")));
        assert_eq!(recent.list().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_kinds_are_never_throttled() {
        let (alerts, recent) = manager(Duration::from_secs(300));

        assert!(alerts.emit(Alert::new(AlertKind::MiddlewareRolledBack, "auth", "first")));
        assert!(alerts.emit(Alert::new(AlertKind::MiddlewareRolledBack, "auth", "second")));
        assert!(alerts.emit(Alert::new(AlertKind::RollbackFailed, "auth", "no snapshot")));
        assert!(alerts.emit(Alert::new(AlertKind::RollbackFailed, "auth", "no snapshot")));
        assert_eq!(recent.list().len(), 4);
    }

    #[test]
    fn test_recent_alerts_bounded() {
        let recent = RecentAlerts::new(2);
        for i in 0..3 {
            recent.emit(&Alert::new(AlertKind::TargetDown, format!("t{i}"), "down"));
        }
        let subjects: Vec<_> = recent.list().into_iter().map(|a| a.subject).collect();
        assert_eq!(subjects, ["t1", "t2"]);
    }

    #[test]
    fn test_severity_mapping() {
        let alert = Alert::new(AlertKind::RollbackFailed, "auth", "no snapshot");
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(alert.kind.as_str(), "rollback-failed");
    }
}
