//! Per-request pipeline execution.
//!
//! # Responsibilities
//! - Run a point-in-time list of entries as nested continuations
//! - Catch handler failures and panics at the chain boundary
//! - Attribute each failure to the entry that raised it and record it
//!
//! # Data Flow
//! ```text
//! Pipeline::execute(exchange, terminal)
//!     → Next(0).run → entry[0].handle(config, exchange, Next(1))
//!         → Next(1).run → entry[1].handle(...)
//!             → ... → Next(len).run → terminal.call(exchange)
//! ```
//!
//! # Design Decisions
//! - A failure is recorded only against the entry that raised it. Errors an
//!   entry merely passes back up from `next` are not counted again
//! - Latency recorded for an entry excludes the time spent in the rest of the
//!   pipeline, so a slow backend does not make every middleware look slow
//! - Errors carrying a `GatewayError` keep their outcome code; anything else is
//!   reported to the client as a generic internal error

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, FutureExt};

use crate::error::GatewayError;
use crate::middleware::entry::{MiddlewareEntry, Phase};
use crate::middleware::handler::{Exchange, MiddlewareError, Terminal};
use crate::observability::metrics;

const NO_FAULT: usize = usize::MAX;

/// Notified whenever a live invocation of an entry fails.
pub trait FailureListener: Send + Sync {
    /// `consecutive` includes the failure being reported.
    fn on_failure(&self, entry: &Arc<MiddlewareEntry>, consecutive: u64);
}

/// State shared by every level of one pipeline run.
struct RunContext {
    /// Index of the entry whose error is unwinding; `len` for the terminal.
    fault: AtomicUsize,
    /// Live runs update metrics and health; sandbox runs do not.
    record: bool,
    listener: Option<Arc<dyn FailureListener>>,
}

/// The remainder of a pipeline, handed to each middleware.
pub struct Next<'a> {
    entries: &'a [Arc<MiddlewareEntry>],
    index: usize,
    terminal: &'a dyn Terminal,
    ctx: &'a RunContext,
    /// Receives the wall time spent in this continuation.
    elapsed: &'a AtomicU64,
}

impl<'a> Next<'a> {
    /// Number of entries still to run before the terminal.
    pub fn remaining(&self) -> usize {
        self.entries.len() - self.index
    }

    /// Continue the pipeline.
    pub fn run(self, exchange: Exchange) -> BoxFuture<'a, Result<Exchange, MiddlewareError>> {
        Box::pin(async move {
            let started = Instant::now();
            let result = match self.entries.get(self.index) {
                Some(entry) => self.invoke(entry, exchange).await,
                None => {
                    let result = self.terminal.call(exchange).await;
                    if result.is_err() {
                        self.ctx.fault.store(self.entries.len(), Ordering::Release);
                    }
                    result
                }
            };
            self.elapsed
                .fetch_add(started.elapsed().as_nanos() as u64, Ordering::AcqRel);
            result
        })
    }

    async fn invoke(
        &self,
        entry: &'a Arc<MiddlewareEntry>,
        exchange: Exchange,
    ) -> Result<Exchange, MiddlewareError> {
        let nested = AtomicU64::new(0);
        let next = Next {
            entries: self.entries,
            index: self.index + 1,
            terminal: self.terminal,
            ctx: self.ctx,
            elapsed: &nested,
        };

        let started = Instant::now();
        let handler = entry.handler();
        let config = &entry.settings().config;
        let outcome = AssertUnwindSafe(async move { handler.handle(config, exchange, next).await })
            .catch_unwind()
            .await;
        let own = started
            .elapsed()
            .saturating_sub(Duration::from_nanos(nested.load(Ordering::Acquire)));

        let result = match outcome {
            Ok(result) => result,
            Err(payload) => {
                // A panic never came from deeper levels; those catch their own.
                self.ctx.fault.store(NO_FAULT, Ordering::Release);
                Err(MiddlewareError::Panic(panic_message(payload)))
            }
        };

        match &result {
            Ok(_) => {
                self.ctx.fault.store(NO_FAULT, Ordering::Release);
                if self.ctx.record {
                    entry.record_success(own);
                    metrics::record_middleware(entry.name(), true, own);
                }
            }
            Err(err) => {
                let fault = self.ctx.fault.load(Ordering::Acquire);
                if fault == NO_FAULT || fault <= self.index {
                    self.ctx.fault.store(self.index, Ordering::Release);
                    self.fail(entry, own, err);
                }
            }
        }
        result
    }

    fn fail(&self, entry: &Arc<MiddlewareEntry>, latency: Duration, err: &MiddlewareError) {
        tracing::warn!(
            middleware = %entry.name(),
            phase = %entry.settings().phase,
            error = %err,
            sandbox = !self.ctx.record,
            "Middleware failed"
        );
        if !self.ctx.record {
            return;
        }
        let consecutive = entry.record_failure(latency, &err.to_string());
        metrics::record_middleware(entry.name(), false, latency);
        if let Some(listener) = &self.ctx.listener {
            listener.on_failure(entry, consecutive);
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Ordered entries for one phase and path, detached from the chain.
pub struct Pipeline {
    phase: Phase,
    entries: Vec<Arc<MiddlewareEntry>>,
    listener: Option<Weak<dyn FailureListener>>,
}

impl Pipeline {
    pub(crate) fn new(
        phase: Phase,
        entries: Vec<Arc<MiddlewareEntry>>,
        listener: Option<Weak<dyn FailureListener>>,
    ) -> Self {
        Self {
            phase,
            entries,
            listener,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn entries(&self) -> &[Arc<MiddlewareEntry>] {
        &self.entries
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run live traffic through the pipeline.
    pub async fn execute(
        &self,
        exchange: Exchange,
        terminal: &dyn Terminal,
    ) -> Result<Exchange, GatewayError> {
        self.run(exchange, terminal, true).await
    }

    /// Run without touching metrics, health or the failure listener.
    pub(crate) async fn execute_sandboxed(
        &self,
        exchange: Exchange,
        terminal: &dyn Terminal,
    ) -> Result<Exchange, GatewayError> {
        self.run(exchange, terminal, false).await
    }

    async fn run(
        &self,
        exchange: Exchange,
        terminal: &dyn Terminal,
        record: bool,
    ) -> Result<Exchange, GatewayError> {
        let ctx = RunContext {
            fault: AtomicUsize::new(NO_FAULT),
            record,
            listener: if record {
                self.listener.as_ref().and_then(Weak::upgrade)
            } else {
                None
            },
        };
        let elapsed = AtomicU64::new(0);
        let next = Next {
            entries: &self.entries,
            index: 0,
            terminal,
            ctx: &ctx,
            elapsed: &elapsed,
        };

        match next.run(exchange).await {
            Ok(exchange) => Ok(exchange),
            Err(MiddlewareError::Gateway(err)) => Err(err),
            Err(err) => {
                let origin = ctx.fault.load(Ordering::Acquire);
                let middleware = self
                    .entries
                    .get(origin)
                    .map(|e| e.name().to_string())
                    .unwrap_or_else(|| "terminal".to_string());
                Err(GatewayError::InternalProcessing {
                    middleware,
                    reason: err.to_string(),
                })
            }
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("phase", &self.phase)
            .field("entries", &self.names())
            .finish()
    }
}
