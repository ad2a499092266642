//! Middleware rollback manager.
//!
//! # Responsibilities
//! - Snapshot and roll back a middleware's settings on request
//! - Roll back automatically when an entry keeps failing
//! - Report every automatic rollback, successful or not, as an alert
//!
//! # Design Decisions
//! - Registered with the chain as its failure listener; the chain holds only
//!   a weak reference, so dropping the manager disables auto-rollback
//! - Auto-rollback fires when the consecutive-failure count reaches the
//!   threshold exactly, so one failing streak produces one rollback attempt
//! - A failed auto-rollback leaves the entry as it is

use std::sync::{Arc, Weak};

use crate::config::schema::RollbackConfig;
use crate::error::GatewayError;
use crate::health::alerts::{Alert, AlertKind, AlertManager};
use crate::middleware::chain::MiddlewareChain;
use crate::middleware::entry::MiddlewareEntry;
use crate::middleware::pipeline::FailureListener;
use crate::middleware::snapshot::Snapshot;
use crate::observability::metrics;

pub struct RollbackManager {
    chain: Arc<MiddlewareChain>,
    alerts: Arc<AlertManager>,
    auto_rollback: bool,
    failure_threshold: u64,
}

impl RollbackManager {
    /// Create the manager and install it as the chain's failure listener.
    pub fn new(
        chain: Arc<MiddlewareChain>,
        alerts: Arc<AlertManager>,
        auto_rollback: bool,
        failure_threshold: u64,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            chain: Arc::clone(&chain),
            alerts,
            auto_rollback,
            failure_threshold: failure_threshold.max(1),
        });
        let listener: Weak<dyn FailureListener> = Arc::downgrade(&manager) as Weak<dyn FailureListener>;
        chain.set_failure_listener(listener);
        manager
    }

    pub fn from_config(
        config: &RollbackConfig,
        chain: Arc<MiddlewareChain>,
        alerts: Arc<AlertManager>,
    ) -> Arc<Self> {
        Self::new(chain, alerts, config.auto_rollback, config.failure_threshold)
    }

    pub fn snapshot(&self, name: &str) -> Result<Snapshot, GatewayError> {
        self.chain.snapshot(name)
    }

    /// Restore the snapshot taken at `timestamp`, or the most recent one that
    /// differs from the current settings.
    pub fn rollback(&self, name: &str, timestamp: Option<u64>) -> Result<Snapshot, GatewayError> {
        let snapshot = self.chain.restore(name, timestamp)?;
        tracing::info!(
            middleware = %name,
            timestamp = snapshot.timestamp,
            revision = snapshot.revision,
            "Middleware rolled back"
        );
        metrics::record_rollback(name, "manual");
        Ok(snapshot)
    }

    pub fn history(&self, name: &str) -> Result<Vec<Snapshot>, GatewayError> {
        self.chain.snapshots(name)
    }

    fn auto_rollback(&self, name: &str, consecutive: u64) {
        match self.chain.restore(name, None) {
            Ok(snapshot) => {
                tracing::warn!(
                    middleware = %name,
                    consecutive_failures = consecutive,
                    timestamp = snapshot.timestamp,
                    "Middleware automatically rolled back"
                );
                metrics::record_rollback(name, "auto");
                self.alerts.emit(
                    Alert::new(
                        AlertKind::MiddlewareRolledBack,
                        name,
                        format!("middleware {name} rolled back after {consecutive} consecutive failures"),
                    )
                    .with_meta("snapshot_timestamp", snapshot.timestamp)
                    .with_meta("consecutive_failures", consecutive),
                );
            }
            Err(e) => {
                tracing::error!(middleware = %name, error = %e, "Automatic rollback failed");
                self.alerts.emit(
                    Alert::new(
                        AlertKind::RollbackFailed,
                        name,
                        format!("automatic rollback of middleware {name} failed: {e}"),
                    )
                    .with_meta("consecutive_failures", consecutive),
                );
            }
        }
    }
}

impl FailureListener for RollbackManager {
    fn on_failure(&self, entry: &Arc<MiddlewareEntry>, consecutive: u64) {
        if self.auto_rollback && consecutive == self.failure_threshold {
            self.auto_rollback(entry.name(), consecutive);
        }
    }
}

impl std::fmt::Debug for RollbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackManager")
            .field("auto_rollback", &self.auto_rollback)
            .field("failure_threshold", &self.failure_threshold)
            .finish()
    }
}
