//! Circuit breaker pattern for outbound dependencies.
//!
//! A breaker stops requests to a failing dependency once a threshold of consecutive failures is
//! reached, rejects calls for a cooldown period, and then lets probe calls through (half-open)
//! to find out whether the dependency has recovered.
//!
//! Open → HalfOpen is evaluated lazily on the next admission check; there is no background
//! timer. All state lives behind one mutex per breaker and the lock is never held across the
//! wrapped operation.
//!
//! Every admission hands out a [`CallPermit`] stamped with the breaker's epoch, which advances
//! on each transition. An outcome reported under an older epoch still counts toward the totals
//! but cannot move the state machine.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CallError, CircuitOpenError};

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive successes in HalfOpen before the circuit closes.
    pub success_threshold: u32,
    /// How long the circuit stays open before admitting a probe, in milliseconds.
    #[serde(with = "crate::serde_millis")]
    pub open_timeout: Duration,
    /// A failure arriving longer than this after the previous one starts a fresh
    /// consecutive-failure count. Zero disables the decay.
    #[serde(with = "crate::serde_millis")]
    pub reset_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            reset_window: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_reset_window(mut self, window: Duration) -> Self {
        self.reset_window = window;
        self
    }
}

/// States of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests allowed, failures counted.
    Closed,
    /// Failing fast - requests immediately rejected.
    Open,
    /// Testing if the dependency recovered - requests allowed as probes.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot of a breaker, for health checks and dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl CircuitBreakerStats {
    /// Failures over completed calls (0.0 to 1.0).
    pub fn failure_rate(&self) -> f64 {
        let completed = self.total_successes + self.total_failures;
        if completed == 0 {
            0.0
        } else {
            self.total_failures as f64 / completed as f64
        }
    }
}

/// Proof that [`CircuitBreaker::try_acquire`] admitted a call, to be handed back with its outcome.
#[must_use = "report the call's outcome with record_success or record_failure"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPermit {
    epoch: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    epoch: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    next_attempt_at: Option<Instant>,
    next_attempt_wall: Option<DateTime<Utc>>,
    last_failure: Option<Instant>,
    last_failure_wall: Option<DateTime<Utc>>,
    last_success_wall: Option<DateTime<Utc>>,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            epoch: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            next_attempt_at: None,
            next_attempt_wall: None,
            last_failure: None,
            last_failure_wall: None,
            last_success_wall: None,
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
        }
    }
}

/// Circuit breaker for a single named dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` once if the breaker admits it, and feed its outcome back.
    ///
    /// The operation's error is returned unchanged inside [`CallError::Failed`]; the breaker only
    /// adds [`CallError::Open`] when it refuses the call, in which case `operation` is never polled.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire()?;

        match operation().await {
            Ok(value) => {
                self.record_success(permit);
                Ok(value)
            }
            Err(err) => {
                self.record_failure(permit);
                Err(CallError::Failed(err))
            }
        }
    }

    /// Admission check. Moves Open → HalfOpen when the open timeout has elapsed.
    ///
    /// Callers that get a permit must report the outcome through
    /// [`record_success`](Self::record_success) or [`record_failure`](Self::record_failure).
    pub fn try_acquire(&self) -> Result<CallPermit, CircuitOpenError> {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;

        if inner.state == CircuitState::Open {
            let now = Instant::now();
            let next_attempt_at = inner.next_attempt_at;
            match next_attempt_at {
                Some(deadline) if now < deadline => {
                    inner.total_rejections += 1;
                    metrics::counter!(
                        "circuit_breaker_rejections_total",
                        "breaker" => self.name.clone()
                    )
                    .increment(1);
                    debug!(breaker = %self.name, "circuit_rejected");

                    return Err(CircuitOpenError {
                        name: self.name.clone(),
                        retry_after: deadline.saturating_duration_since(now),
                        retry_at: inner.next_attempt_wall.unwrap_or_else(Utc::now),
                    });
                }
                _ => self.transition_to(&mut inner, CircuitState::HalfOpen),
            }
        }

        Ok(CallPermit { epoch: inner.epoch })
    }

    /// Record a successful call.
    pub fn record_success(&self, permit: CallPermit) {
        let mut inner = self.inner.lock();
        inner.total_successes += 1;
        inner.last_success_wall = Some(Utc::now());

        if permit.epoch != inner.epoch {
            debug!(breaker = %self.name, "stale_outcome_ignored");
            return;
        }

        match inner.state {
            CircuitState::Closed => {
                // Failures must be consecutive to trip the breaker
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    self.transition_to(&mut inner, CircuitState::Closed);
                }
            }
            // Permits are never issued while Open.
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, permit: CallPermit) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.total_failures += 1;
        inner.last_failure_wall = Some(Utc::now());

        if permit.epoch != inner.epoch {
            debug!(breaker = %self.name, "stale_outcome_ignored");
            return;
        }

        match inner.state {
            CircuitState::Closed => {
                if self.failure_count_expired(&inner, now) {
                    inner.consecutive_failures = 0;
                }
                inner.consecutive_failures += 1;
                inner.last_failure = Some(now);

                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition_to(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.last_failure = Some(now);
                self.transition_to(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {
                inner.last_failure = Some(now);
            }
        }
    }

    /// Hand back a permit whose call was never sent. Nothing is recorded and the admission no
    /// longer counts toward `total_calls`.
    pub fn release(&self, _permit: CallPermit) {
        let mut inner = self.inner.lock();
        inner.total_calls = inner.total_calls.saturating_sub(1);
    }

    /// Force the breaker back to Closed. Cumulative totals are kept.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            self.transition_to(&mut inner, CircuitState::Closed);
        } else {
            inner.epoch += 1;
        }
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.next_attempt_at = None;
        inner.next_attempt_wall = None;
        inner.last_failure = None;
    }

    /// Current state. Does not evaluate the Open → HalfOpen timeout.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_calls: inner.total_calls,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
            last_failure_at: inner.last_failure_wall,
            last_success_at: inner.last_success_wall,
            next_attempt_at: inner.next_attempt_wall,
        }
    }

    fn failure_count_expired(&self, inner: &BreakerState, now: Instant) -> bool {
        if self.config.reset_window.is_zero() {
            return false;
        }
        inner
            .last_failure
            .is_some_and(|last| now.saturating_duration_since(last) > self.config.reset_window)
    }

    fn transition_to(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.epoch += 1;

        match to {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.consecutive_successes = 0;
                inner.next_attempt_at = None;
                inner.next_attempt_wall = None;
            }
            CircuitState::Open => {
                inner.consecutive_successes = 0;
                inner.next_attempt_at = Some(Instant::now() + self.config.open_timeout);
                inner.next_attempt_wall = Some(wall_clock_after(self.config.open_timeout));
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes = 0;
            }
        }

        metrics::counter!(
            "circuit_breaker_transitions_total",
            "breaker" => self.name.clone(),
            "to" => to.as_str()
        )
        .increment(1);

        if to == CircuitState::Open {
            warn!(
                breaker = %self.name,
                from = %from,
                to = %to,
                consecutive_failures = inner.consecutive_failures,
                open_timeout_ms = self.config.open_timeout.as_millis() as u64,
                "circuit_transition"
            );
        } else {
            info!(breaker = %self.name, from = %from, to = %to, "circuit_transition");
        }
    }
}

fn wall_clock_after(delay: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(now)
}

/// Registry of breakers, one per dependency name.
///
/// Constructed once at startup and shared (usually behind an `Arc`) with every component that
/// calls out to a dependency.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    pub fn default_config(&self) -> &CircuitBreakerConfig {
        &self.default_config
    }

    /// Get or create the breaker for a dependency using the default config.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with_config(name, self.default_config)
    }

    /// Get or create the breaker for a dependency. `config` only applies on first creation.
    pub fn get_or_create_with_config(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }

        // The entry lock makes concurrent first access create exactly one breaker.
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn stats(&self, name: &str) -> Option<CircuitBreakerStats> {
        self.breakers.get(name).map(|entry| entry.stats())
    }

    /// Stats for every known breaker, sorted by name.
    pub fn all_stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.iter().map(|entry| entry.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Reset one breaker. Returns false if no breaker exists under that name.
    pub fn reset(&self, name: &str) -> bool {
        match self.breakers.get(name) {
            Some(entry) => {
                entry.reset();
                true
            }
            None => false,
        }
    }

    /// Reset every breaker to Closed, keeping cumulative totals.
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.reset();
        }
    }

    /// A dependency is healthy when its breaker is Closed, or when it has never been called.
    pub fn is_healthy(&self, name: &str) -> bool {
        self.breakers
            .get(name)
            .map(|entry| entry.state() == CircuitState::Closed)
            .unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
