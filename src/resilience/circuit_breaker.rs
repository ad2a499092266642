//! Circuit breaker for target protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: target assumed down, calls fail fast without a network attempt
//! - Half-Open: one trial call is in flight
//!
//! # State Transitions
//! ```text
//! Closed → Open: failures within window >= threshold
//! Open → Half-Open: first call at or after open_until (that call is the trial)
//! Half-Open → Closed: trial succeeds (failure counter reset)
//! Half-Open → Open: trial fails (open_until reset)
//! ```
//!
//! # Design Decisions
//! - Per-target breaker, kept in a `DashMap` registry
//! - State, generation and `open_until` share one `AtomicU64`, so every
//!   transition is a single compare-and-set
//! - Outcomes carry the generation they were admitted under; outcomes from an
//!   older generation are ignored
//! - A `CallPermit` dropped without an outcome counts as a failure

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::config::schema::CircuitBreakerConfig;
use crate::error::GatewayError;
use crate::observability::metrics;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_bits(bits: u64) -> Self {
        match bits & STATE_MASK {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    fn bits(self) -> u64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Packed word layout: [open_until_ms: 40 | generation: 22 | state: 2].
const STATE_BITS: u32 = 2;
const GEN_BITS: u32 = 22;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;
const GEN_MASK: u64 = (1 << GEN_BITS) - 1;
const UNTIL_SHIFT: u32 = STATE_BITS + GEN_BITS;
const UNTIL_MAX: u64 = (1 << (64 - UNTIL_SHIFT)) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Word {
    state: CircuitState,
    generation: u64,
    open_until_ms: u64,
}

impl Word {
    fn unpack(bits: u64) -> Self {
        Self {
            state: CircuitState::from_bits(bits),
            generation: (bits >> STATE_BITS) & GEN_MASK,
            open_until_ms: bits >> UNTIL_SHIFT,
        }
    }

    fn pack(self) -> u64 {
        (self.open_until_ms.min(UNTIL_MAX) << UNTIL_SHIFT)
            | ((self.generation & GEN_MASK) << STATE_BITS)
            | self.state.bits()
    }

    fn next(self, state: CircuitState, open_until_ms: u64) -> Self {
        Self {
            state,
            generation: (self.generation + 1) & GEN_MASK,
            open_until_ms,
        }
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
}

impl From<&CircuitBreakerConfig> for BreakerSettings {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            window: Duration::from_secs(config.window_secs),
            cooldown: Duration::from_secs(config.cooldown_secs),
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&CircuitBreakerConfig::default())
    }
}

/// Per-target circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    settings: BreakerSettings,
    epoch: Instant,
    word: AtomicU64,
    failures: AtomicU32,
    window_start_ms: AtomicU64,
}

/// Read-only view of a breaker for admin/reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub target: String,
    pub state: CircuitState,
    pub failures_in_window: u32,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, settings: BreakerSettings) -> Self {
        Self::with_epoch(target, settings, Instant::now())
    }

    /// Create a breaker whose clock starts at `epoch`. Instants passed to the
    /// `*_at` methods must not precede it.
    pub fn with_epoch(target: impl Into<String>, settings: BreakerSettings, epoch: Instant) -> Self {
        let closed = Word {
            state: CircuitState::Closed,
            generation: 0,
            open_until_ms: 0,
        };
        Self {
            target: target.into(),
            settings,
            epoch,
            word: AtomicU64::new(closed.pack()),
            failures: AtomicU32::new(0),
            window_start_ms: AtomicU64::new(0),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> CircuitState {
        Word::unpack(self.word.load(Ordering::Acquire)).state
    }

    pub fn failures_in_window(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    pub fn status(&self) -> BreakerStatus {
        BreakerStatus {
            target: self.target.clone(),
            state: self.state(),
            failures_in_window: self.failures_in_window(),
        }
    }

    fn millis(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// Ask permission to call the target.
    pub fn try_acquire(self: &Arc<Self>) -> Result<CallPermit, GatewayError> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(self: &Arc<Self>, now: Instant) -> Result<CallPermit, GatewayError> {
        let now_ms = self.millis(now);
        loop {
            let bits = self.word.load(Ordering::Acquire);
            let word = Word::unpack(bits);
            match word.state {
                CircuitState::Closed => return Ok(self.permit(word.generation)),
                CircuitState::Open if now_ms >= word.open_until_ms => {
                    let trial = word.next(CircuitState::HalfOpen, word.open_until_ms);
                    if self.transition(bits, trial) {
                        return Ok(self.permit(trial.generation));
                    }
                }
                CircuitState::Open => {
                    return Err(self.rejection(Duration::from_millis(word.open_until_ms - now_ms)));
                }
                // The single trial slot is taken.
                CircuitState::HalfOpen => return Err(self.rejection(Duration::from_secs(1))),
            }
        }
    }

    fn permit(self: &Arc<Self>, generation: u64) -> CallPermit {
        CallPermit {
            breaker: Some(self.clone()),
            generation,
        }
    }

    fn rejection(&self, retry_after: Duration) -> GatewayError {
        GatewayError::CircuitOpen {
            target: self.target.clone(),
            retry_after,
        }
    }

    fn transition(&self, from_bits: u64, to: Word) -> bool {
        let ok = self
            .word
            .compare_exchange(from_bits, to.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok {
            let from = Word::unpack(from_bits).state;
            tracing::info!(
                target_addr = %self.target,
                from = %from,
                to = %to.state,
                "Circuit breaker state change"
            );
            metrics::record_breaker_state(&self.target, to.state);
        }
        ok
    }

    fn on_success(&self, generation: u64, now: Instant) {
        let now_ms = self.millis(now);
        let bits = self.word.load(Ordering::Acquire);
        let word = Word::unpack(bits);
        if word.generation != generation || word.state != CircuitState::HalfOpen {
            return;
        }
        self.failures.store(0, Ordering::Release);
        self.window_start_ms.store(now_ms, Ordering::Release);
        self.transition(bits, word.next(CircuitState::Closed, 0));
    }

    fn on_failure(&self, generation: u64, now: Instant) {
        let now_ms = self.millis(now);
        let open_until = now_ms + self.settings.cooldown.as_millis() as u64;
        let bits = self.word.load(Ordering::Acquire);
        let word = Word::unpack(bits);
        if word.generation != generation {
            return;
        }

        match word.state {
            CircuitState::HalfOpen => {
                self.transition(bits, word.next(CircuitState::Open, open_until));
            }
            CircuitState::Closed => {
                if self.count_failure(now_ms) >= self.settings.failure_threshold
                    && self.transition(bits, word.next(CircuitState::Open, open_until))
                {
                    self.failures.store(0, Ordering::Release);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Count a failure in the current window, starting a new window if the
    /// old one expired.
    fn count_failure(&self, now_ms: u64) -> u32 {
        let window_ms = self.settings.window.as_millis() as u64;
        let start = self.window_start_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(start) > window_ms
            && self
                .window_start_ms
                .compare_exchange(start, now_ms, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.failures.store(0, Ordering::Release);
        }
        self.failures.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Permission to make one call. Resolve it with `success` or `failure`;
/// dropping it unresolved counts as a failure.
#[derive(Debug)]
pub struct CallPermit {
    breaker: Option<Arc<CircuitBreaker>>,
    generation: u64,
}

impl CallPermit {
    pub fn success(self) {
        self.success_at(Instant::now());
    }

    pub fn failure(self) {
        self.failure_at(Instant::now());
    }

    pub fn success_at(mut self, now: Instant) {
        if let Some(breaker) = self.breaker.take() {
            breaker.on_success(self.generation, now);
        }
    }

    pub fn failure_at(mut self, now: Instant) {
        if let Some(breaker) = self.breaker.take() {
            breaker.on_failure(self.generation, now);
        }
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if let Some(breaker) = self.breaker.take() {
            breaker.on_failure(self.generation, Instant::now());
        }
    }
}

/// Breakers keyed by target address.
#[derive(Debug)]
pub struct BreakerRegistry {
    settings: BreakerSettings,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: DashMap::new(),
        }
    }

    /// Get or create the breaker for `target`.
    pub fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(target) {
            return existing.clone();
        }
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(target, self.settings)))
            .clone()
    }

    /// Drop breakers of targets that are no longer configured.
    pub fn retain(&self, live: &[String]) {
        self.breakers.retain(|target, _| live.contains(target));
    }

    pub fn statuses(&self) -> Vec<BreakerStatus> {
        let mut all: Vec<_> = self.breakers.iter().map(|b| b.status()).collect();
        all.sort_by(|a, b| a.target.cmp(&b.target));
        all
    }
}
