//! Middleware registrations.
//!
//! # Responsibilities
//! - Validate priority and phase
//! - Hold one registration: handler, settings, metrics, health, snapshots
//!
//! # Design Decisions
//! - An entry's settings are immutable; an update publishes a new entry
//!   that shares the same `EntryState`, so pipelines already built keep the
//!   settings they were built with
//! - Per-entry state is locked per entry, never chain-wide

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;
use crate::middleware::handler::Middleware;
use crate::middleware::health::MiddlewareHealth;
use crate::middleware::metrics::{MetricsRecorder, MetricsSnapshot};
use crate::middleware::snapshot::{Snapshot, SnapshotRing, SNAPSHOT_CAPACITY};

pub const MIN_PRIORITY: i64 = 0;
pub const MAX_PRIORITY: i64 = 1000;

/// Point in the request lifecycle where an entry runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    PreRouting,
    PostRouting,
    PreResponse,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::PreRouting => "pre-routing",
            Phase::PostRouting => "post-routing",
            Phase::PreResponse => "pre-response",
        }
    }
}

impl FromStr for Phase {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre-routing" => Ok(Phase::PreRouting),
            "post-routing" => Ok(Phase::PostRouting),
            "pre-response" => Ok(Phase::PreResponse),
            other => Err(GatewayError::InvalidPhase(other.to_string())),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check a priority against the allowed range.
pub fn validate_priority(priority: i64) -> Result<u16, GatewayError> {
    if (MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        Ok(priority as u16)
    } else {
        Err(GatewayError::InvalidPriority(priority))
    }
}

/// The configurable part of an entry.
#[derive(Debug, Clone, PartialEq)]
pub struct MiddlewareSettings {
    pub priority: u16,
    pub routes: Vec<String>,
    pub phase: Phase,
    pub enabled: bool,
    pub config: Value,
    /// Identifies this exact settings value; bumped on every change.
    pub revision: u64,
}

/// State shared by every published version of one registration.
#[derive(Debug)]
pub struct EntryState {
    pub(crate) metrics: Mutex<MetricsRecorder>,
    health: AtomicU8,
    pub(crate) snapshots: Mutex<SnapshotRing>,
    next_revision: AtomicU64,
}

impl EntryState {
    fn new() -> Self {
        Self {
            metrics: Mutex::new(MetricsRecorder::default()),
            health: AtomicU8::new(MiddlewareHealth::Healthy as u8),
            snapshots: Mutex::new(SnapshotRing::new(SNAPSHOT_CAPACITY)),
            next_revision: AtomicU64::new(1),
        }
    }
}

/// A registered middleware.
pub struct MiddlewareEntry {
    name: String,
    /// Registration order; tie-break for equal priorities.
    seq: u64,
    handler: Arc<dyn Middleware>,
    settings: MiddlewareSettings,
    state: Arc<EntryState>,
}

impl MiddlewareEntry {
    pub(crate) fn new(
        name: String,
        seq: u64,
        handler: Arc<dyn Middleware>,
        priority: u16,
        routes: Vec<String>,
        phase: Phase,
        config: Value,
    ) -> Self {
        Self {
            name,
            seq,
            handler,
            settings: MiddlewareSettings {
                priority,
                routes,
                phase,
                enabled: true,
                config,
                revision: 0,
            },
            state: Arc::new(EntryState::new()),
        }
    }

    /// Publish a new version of this entry with changed settings.
    pub(crate) fn with_settings(&self, mut settings: MiddlewareSettings) -> Self {
        settings.revision = self.state.next_revision.fetch_add(1, Ordering::AcqRel);
        self.restored(settings)
    }

    /// Publish a new version carrying `settings` verbatim, revision included.
    pub(crate) fn restored(&self, settings: MiddlewareSettings) -> Self {
        Self {
            name: self.name.clone(),
            seq: self.seq,
            handler: Arc::clone(&self.handler),
            settings,
            state: Arc::clone(&self.state),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn settings(&self) -> &MiddlewareSettings {
        &self.settings
    }

    pub fn handler(&self) -> &Arc<dyn Middleware> {
        &self.handler
    }

    pub(crate) fn state(&self) -> &Arc<EntryState> {
        &self.state
    }

    /// Sort key: priority, then registration order.
    pub(crate) fn order_key(&self) -> (u16, u64) {
        (self.settings.priority, self.seq)
    }

    pub fn health(&self) -> MiddlewareHealth {
        MiddlewareHealth::from(self.state.health.load(Ordering::Acquire))
    }

    /// Store a new health status; returns the previous one.
    pub(crate) fn set_health(&self, health: MiddlewareHealth) -> MiddlewareHealth {
        MiddlewareHealth::from(self.state.health.swap(health as u8, Ordering::AcqRel))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.state.metrics.lock().snapshot()
    }

    /// Record a successful live invocation.
    pub(crate) fn record_success(&self, latency: Duration) {
        self.state.metrics.lock().record_success(latency);
        if self.set_health(MiddlewareHealth::Healthy) != MiddlewareHealth::Healthy {
            tracing::info!(middleware = %self.name, "Middleware healthy again");
        }
    }

    /// Record a failed live invocation; returns the consecutive-failure count.
    pub(crate) fn record_failure(&self, latency: Duration, error: &str) -> u64 {
        self.state.metrics.lock().record_failure(latency, error)
    }

    /// Capture the current settings into the snapshot history.
    pub(crate) fn capture_snapshot(&self) -> Snapshot {
        let mut ring = self.state.snapshots.lock();
        let snapshot = Snapshot::capture(&self.settings, ring.last_timestamp());
        ring.push(snapshot.clone());
        snapshot
    }

    /// Snapshot history, oldest first.
    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.state.snapshots.lock().to_vec()
    }

    pub fn view(&self) -> EntryView {
        EntryView {
            name: self.name.clone(),
            priority: self.settings.priority,
            phase: self.settings.phase,
            routes: self.settings.routes.clone(),
            enabled: self.settings.enabled,
            config: self.settings.config.clone(),
            revision: self.settings.revision,
            health: self.health(),
            metrics: self.metrics(),
            snapshots: self.state.snapshots.lock().len(),
        }
    }
}

impl fmt::Debug for MiddlewareEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareEntry")
            .field("name", &self.name)
            .field("seq", &self.seq)
            .field("settings", &self.settings)
            .finish()
    }
}

/// Read accessor for one entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntryView {
    pub name: String,
    pub priority: u16,
    pub phase: Phase,
    pub routes: Vec<String>,
    pub enabled: bool,
    pub config: Value,
    pub revision: u64,
    pub health: MiddlewareHealth,
    pub metrics: MetricsSnapshot,
    pub snapshots: usize,
}
