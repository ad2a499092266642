//! Middleware chain manager.
//!
//! # Responsibilities
//! - Register, unregister and update middleware entries
//! - Keep a total execution order: priority, then registration order
//! - Build point-in-time pipelines for a phase and path
//!
//! # Design Decisions
//! - The sorted index is published through `ArcSwap`; building a pipeline never
//!   takes a lock and never waits on a writer
//! - Writers serialize on a mutex held only while the new index is computed and
//!   published
//! - Updating an entry publishes a new `MiddlewareEntry` value; pipelines built
//!   earlier keep the version they captured

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::error::GatewayError;
use crate::middleware::entry::{validate_priority, EntryView, MiddlewareEntry, MiddlewareSettings, Phase};
use crate::middleware::handler::Middleware;
use crate::middleware::pipeline::{FailureListener, Pipeline};
use crate::middleware::snapshot::Snapshot;
use crate::routing::any_route_matches;

type Index = Vec<Arc<MiddlewareEntry>>;

pub struct MiddlewareChain {
    index: ArcSwap<Index>,
    writer: Mutex<()>,
    next_seq: AtomicU64,
    listener: RwLock<Option<Weak<dyn FailureListener>>>,
    snapshot_on_update: bool,
}

impl MiddlewareChain {
    pub fn new(snapshot_on_update: bool) -> Self {
        Self {
            index: ArcSwap::from_pointee(Vec::new()),
            writer: Mutex::new(()),
            next_seq: AtomicU64::new(0),
            listener: RwLock::new(None),
            snapshot_on_update,
        }
    }

    /// Install the listener notified on live failures (the rollback manager).
    pub fn set_failure_listener(&self, listener: Weak<dyn FailureListener>) {
        *self.listener.write() = Some(listener);
    }

    pub fn register(
        &self,
        name: &str,
        handler: Arc<dyn Middleware>,
        priority: i64,
        routes: Vec<String>,
        phase: &str,
        config: Value,
    ) -> Result<(), GatewayError> {
        let priority = validate_priority(priority)?;
        let phase: Phase = phase.parse()?;

        let _guard = self.writer.lock();
        let current = self.index.load();
        if current.iter().any(|e| e.name() == name) {
            return Err(GatewayError::Conflict(name.to_string()));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(MiddlewareEntry::new(
            name.to_string(),
            seq,
            handler,
            priority,
            routes,
            phase,
            config,
        ));

        let mut next: Index = current.as_ref().clone();
        next.push(entry);
        self.publish(next);

        tracing::info!(middleware = %name, priority, phase = %phase, "Middleware registered");
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<(), GatewayError> {
        let removed = {
            let _guard = self.writer.lock();
            let current = self.index.load();
            let position = current
                .iter()
                .position(|e| e.name() == name)
                .ok_or_else(|| GatewayError::not_found("middleware", name))?;
            let mut next: Index = current.as_ref().clone();
            let removed = next.remove(position);
            self.publish(next);
            removed
        };

        if let Err(e) = removed.handler().cleanup() {
            tracing::warn!(middleware = %name, error = %e, "Middleware cleanup failed");
        }
        tracing::info!(middleware = %name, "Middleware unregistered");
        Ok(())
    }

    pub fn update_priority(&self, name: &str, priority: i64) -> Result<(), GatewayError> {
        let priority = validate_priority(priority)?;
        self.modify(name, |s| s.priority = priority)
    }

    pub fn update_routes(&self, name: &str, routes: Vec<String>) -> Result<(), GatewayError> {
        self.modify(name, |s| s.routes = routes)
    }

    pub fn update_phase(&self, name: &str, phase: &str) -> Result<(), GatewayError> {
        let phase: Phase = phase.parse()?;
        self.modify(name, |s| s.phase = phase)
    }

    pub fn update_config(&self, name: &str, config: Value) -> Result<(), GatewayError> {
        self.modify(name, |s| s.config = config)
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), GatewayError> {
        self.modify(name, |s| s.enabled = enabled)
    }

    /// Apply `change` to a copy of the entry's settings and publish it.
    fn modify(&self, name: &str, change: impl FnOnce(&mut MiddlewareSettings)) -> Result<(), GatewayError> {
        let _guard = self.writer.lock();
        let current = self.index.load();
        let position = current
            .iter()
            .position(|e| e.name() == name)
            .ok_or_else(|| GatewayError::not_found("middleware", name))?;
        let entry = &current[position];

        if self.snapshot_on_update {
            entry.capture_snapshot();
        }
        let mut settings = entry.settings().clone();
        change(&mut settings);
        let updated = Arc::new(entry.with_settings(settings));

        tracing::info!(
            middleware = %name,
            revision = updated.settings().revision,
            priority = updated.settings().priority,
            phase = %updated.settings().phase,
            enabled = updated.settings().enabled,
            "Middleware updated"
        );

        let mut next: Index = current.as_ref().clone();
        next[position] = updated;
        self.publish(next);
        Ok(())
    }

    /// Sort and swap in a new index. Caller holds the writer lock.
    fn publish(&self, mut next: Index) {
        next.sort_by_key(|e| e.order_key());
        self.index.store(Arc::new(next));
    }

    pub fn get(&self, name: &str) -> Option<Arc<MiddlewareEntry>> {
        self.index.load().iter().find(|e| e.name() == name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Every entry in execution order.
    pub fn list(&self) -> Vec<EntryView> {
        self.index.load().iter().map(|e| e.view()).collect()
    }

    pub fn len(&self) -> usize {
        self.index.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.load().is_empty()
    }

    /// Current index, for background scans.
    pub(crate) fn entries(&self) -> Arc<Index> {
        self.index.load_full()
    }

    /// Enabled entries of `phase` whose routes match `path`, in execution order.
    pub fn build_pipeline(&self, phase: Phase, path: &str) -> Pipeline {
        let index = self.index.load();
        let entries = index
            .iter()
            .filter(|e| {
                let s = e.settings();
                s.enabled && s.phase == phase && any_route_matches(&s.routes, path)
            })
            .cloned()
            .collect();
        Pipeline::new(phase, entries, self.listener.read().clone())
    }

    /// Capture the entry's current settings.
    pub fn snapshot(&self, name: &str) -> Result<Snapshot, GatewayError> {
        let entry = self
            .get(name)
            .ok_or_else(|| GatewayError::not_found("middleware", name))?;
        let snapshot = entry.capture_snapshot();
        tracing::debug!(middleware = %name, timestamp = snapshot.timestamp, "Snapshot captured");
        Ok(snapshot)
    }

    pub fn snapshots(&self, name: &str) -> Result<Vec<Snapshot>, GatewayError> {
        self.get(name)
            .map(|e| e.snapshots())
            .ok_or_else(|| GatewayError::not_found("middleware", name))
    }

    /// Restore a snapshot: pick it under the entry's lock, then publish.
    ///
    /// With no timestamp the newest snapshot that differs from the current
    /// settings is used. Newer snapshots are discarded.
    pub(crate) fn restore(&self, name: &str, timestamp: Option<u64>) -> Result<Snapshot, GatewayError> {
        let entry = self
            .get(name)
            .ok_or_else(|| GatewayError::not_found("middleware", name))?;

        let snapshot = {
            let mut ring = entry.state().snapshots.lock();
            let position = match timestamp {
                Some(ts) => ring.position_of(ts),
                None => ring.latest_before(entry.settings().revision),
            };
            let position = position.ok_or_else(|| {
                GatewayError::not_found(
                    "snapshot",
                    match timestamp {
                        Some(ts) => format!("{name}@{ts}"),
                        None => name.to_string(),
                    },
                )
            })?;
            let snapshot = ring
                .get(position)
                .cloned()
                .ok_or_else(|| GatewayError::not_found("snapshot", name))?;
            ring.truncate_after(position);
            snapshot
        };

        {
            let _guard = self.writer.lock();
            let current = self.index.load();
            let position = current
                .iter()
                .position(|e| e.name() == name)
                .ok_or_else(|| GatewayError::not_found("middleware", name))?;
            let mut next: Index = current.as_ref().clone();
            next[position] = Arc::new(current[position].restored(snapshot.to_settings()));
            self.publish(next);
        }

        entry.state().metrics.lock().reset_consecutive_failures();
        Ok(snapshot)
    }
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new(true)
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("entries", &self.len())
            .field("snapshot_on_update", &self.snapshot_on_update)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use futures_util::future::BoxFuture;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::middleware::handler::{Exchange, MiddlewareError, Passthrough};
    use crate::middleware::pipeline::tests::{exchange, Flaky, Tracer};
    use crate::middleware::pipeline::Next;

    fn tracer(name: &'static str, trace: &Arc<Mutex<Vec<&'static str>>>) -> Arc<dyn Middleware> {
        Arc::new(Tracer {
            name,
            trace: Arc::clone(trace),
        })
    }

    fn all() -> Vec<String> {
        vec!["*".into()]
    }

    #[test]
    fn test_register_validation() {
        let chain = MiddlewareChain::default();
        chain
            .register("auth", Arc::new(Flaky), 10, all(), "pre-routing", Value::Null)
            .unwrap();

        assert_eq!(
            chain
                .register("auth", Arc::new(Flaky), 20, all(), "pre-routing", Value::Null)
                .unwrap_err(),
            GatewayError::Conflict("auth".into())
        );
        assert_eq!(
            chain
                .register("x", Arc::new(Flaky), 1001, all(), "pre-routing", Value::Null)
                .unwrap_err(),
            GatewayError::InvalidPriority(1001)
        );
        assert_eq!(
            chain
                .register("x", Arc::new(Flaky), 5, all(), "during", Value::Null)
                .unwrap_err(),
            GatewayError::InvalidPhase("during".into())
        );
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_unregister_twice_is_not_found() {
        let chain = MiddlewareChain::default();
        chain
            .register("auth", Arc::new(Flaky), 10, all(), "pre-routing", Value::Null)
            .unwrap();

        chain.unregister("auth").unwrap();
        let missing = GatewayError::not_found("middleware", "auth");
        assert_eq!(chain.unregister("auth").unwrap_err(), missing);
        assert_eq!(chain.unregister("auth").unwrap_err(), missing);
        assert!(chain.is_empty());
    }

    #[test]
    fn test_order_by_priority_then_registration() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::default();
        chain.register("late", tracer("late", &trace), 50, all(), "pre-routing", Value::Null).unwrap();
        chain.register("first", tracer("first", &trace), 10, all(), "pre-routing", Value::Null).unwrap();
        chain.register("tie-a", tracer("tie-a", &trace), 30, all(), "pre-routing", Value::Null).unwrap();
        chain.register("tie-b", tracer("tie-b", &trace), 30, all(), "pre-routing", Value::Null).unwrap();
        chain.register("other", tracer("other", &trace), 0, all(), "pre-response", Value::Null).unwrap();

        let pipeline = chain.build_pipeline(Phase::PreRouting, "/any");
        assert_eq!(pipeline.names(), ["first", "tie-a", "tie-b", "late"]);

        chain.update_priority("late", 20).unwrap();
        let pipeline = chain.build_pipeline(Phase::PreRouting, "/any");
        assert_eq!(pipeline.names(), ["first", "late", "tie-a", "tie-b"]);
    }

    #[test]
    fn test_route_and_enabled_filtering() {
        let chain = MiddlewareChain::default();
        chain
            .register("api", Arc::new(Flaky), 1, vec!["/api/*".into()], "pre-routing", Value::Null)
            .unwrap();
        chain
            .register("versioned", Arc::new(Flaky), 2, vec!["/api/v*/users".into()], "pre-routing", Value::Null)
            .unwrap();

        assert_eq!(chain.build_pipeline(Phase::PreRouting, "/api/v1/users").names(), ["api", "versioned"]);
        assert_eq!(chain.build_pipeline(Phase::PreRouting, "/api/v1/accounts").names(), ["api"]);
        assert!(chain.build_pipeline(Phase::PreRouting, "/other").is_empty());

        chain.set_enabled("api", false).unwrap();
        assert_eq!(chain.build_pipeline(Phase::PreRouting, "/api/v1/users").names(), ["versioned"]);

        chain.update_routes("versioned", vec!["/other".into()]).unwrap();
        assert_eq!(chain.build_pipeline(Phase::PreRouting, "/other").names(), ["versioned"]);

        chain.update_phase("versioned", "post-routing").unwrap();
        assert!(chain.build_pipeline(Phase::PreRouting, "/other").is_empty());
        assert_eq!(chain.build_pipeline(Phase::PostRouting, "/other").names(), ["versioned"]);
    }

    #[tokio::test]
    async fn test_built_pipeline_is_point_in_time() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::default();
        chain.register("a", tracer("a", &trace), 1, all(), "pre-routing", Value::Null).unwrap();

        let pipeline = chain.build_pipeline(Phase::PreRouting, "/x");
        chain.register("b", tracer("b", &trace), 0, all(), "pre-routing", Value::Null).unwrap();
        chain.unregister("a").unwrap();

        pipeline.execute(exchange("/x"), &Passthrough).await.unwrap();
        assert_eq!(*trace.lock(), ["a"]);
        assert_eq!(chain.build_pipeline(Phase::PreRouting, "/x").names(), ["b"]);
    }

    #[test]
    fn test_updates_snapshot_previous_settings() {
        let chain = MiddlewareChain::default();
        chain
            .register("h", Arc::new(Flaky), 10, all(), "pre-routing", json!({ "v": 1 }))
            .unwrap();
        chain.update_config("h", json!({ "v": 2 })).unwrap();
        chain.update_priority("h", 20).unwrap();

        let snapshots = chain.snapshots("h").unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].config, json!({ "v": 1 }));
        assert_eq!(snapshots[1].config, json!({ "v": 2 }));
        assert_eq!(snapshots[1].priority, 10);
        assert!(snapshots[0].timestamp < snapshots[1].timestamp);

        let current = chain.get("h").unwrap();
        assert_eq!(current.settings().priority, 20);
        assert_eq!(current.settings().revision, 2);
    }

    #[test]
    fn test_restore_latest_and_by_timestamp() {
        let chain = MiddlewareChain::default();
        chain
            .register("h", Arc::new(Flaky), 10, all(), "pre-routing", json!({ "v": 1 }))
            .unwrap();
        let first = chain.snapshot("h").unwrap();
        chain.update_config("h", json!({ "v": 2 })).unwrap();
        chain.update_config("h", json!({ "v": 3 })).unwrap();

        let restored = chain.restore("h", None).unwrap();
        assert_eq!(restored.config, json!({ "v": 2 }));
        assert_eq!(chain.get("h").unwrap().settings().config, json!({ "v": 2 }));

        chain.restore("h", Some(first.timestamp)).unwrap();
        assert_eq!(chain.get("h").unwrap().settings().config, json!({ "v": 1 }));
        assert_eq!(chain.snapshots("h").unwrap().len(), 1);

        // Only the current settings remain in history.
        assert_eq!(
            chain.restore("h", None).unwrap_err(),
            GatewayError::not_found("snapshot", "h")
        );
        assert!(matches!(
            chain.restore("h", Some(1)),
            Err(GatewayError::NotFound { kind: "snapshot", .. })
        ));
    }

    struct CleanupFlag(Arc<AtomicBool>);

    impl Middleware for CleanupFlag {
        fn handle<'a>(
            &'a self,
            _config: &'a Value,
            exchange: Exchange,
            next: Next<'a>,
        ) -> BoxFuture<'a, Result<Exchange, MiddlewareError>> {
            next.run(exchange)
        }

        fn cleanup(&self) -> Result<(), MiddlewareError> {
            self.0.store(true, Ordering::SeqCst);
            Err(MiddlewareError::handler("already closed"))
        }
    }

    #[test]
    fn test_unregister_runs_cleanup() {
        let flag = Arc::new(AtomicBool::new(false));
        let chain = MiddlewareChain::default();
        chain
            .register("c", Arc::new(CleanupFlag(Arc::clone(&flag))), 1, all(), "pre-routing", Value::Null)
            .unwrap();

        // A failing cleanup is logged, not returned.
        chain.unregister("c").unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }
}
