//! Sliding-window rate limiting for outbound dependencies.
//!
//! Each limiter keeps two trailing-window budgets: a request count and a token count (LLM
//! providers bill and throttle on tokens). Callers are suspended until capacity frees up rather
//! than being rejected after the fact; a fail-fast mode is available through
//! [`RateLimiter::try_acquire`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::error::RateLimitError;

/// Configuration for a sliding-window rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum outbound requests inside one window.
    pub max_requests_per_window: u32,
    /// Maximum estimated tokens (request + response) inside one window.
    pub max_tokens_per_window: u64,
    /// Length of the trailing window in milliseconds.
    #[serde(with = "crate::serde_millis")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_window: 60,
            max_tokens_per_window: 150_000,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    pub fn with_max_requests(mut self, max: u32) -> Self {
        self.max_requests_per_window = max;
        self
    }

    pub fn with_max_tokens(mut self, max: u64) -> Self {
        self.max_tokens_per_window = max;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

/// Result of checking a cost against the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Ready,
    Wait(Duration),
    /// The cost can never fit: zero request budget, or more tokens than the whole window allows.
    Impossible,
}

/// Trailing-window accounting. The clock is supplied by the caller.
///
/// `token_sum` is kept wide so that costs near `u64::MAX` add and expire exactly.
#[derive(Debug, Default)]
pub(crate) struct SlidingWindow {
    requests: VecDeque<Instant>,
    tokens: VecDeque<(Instant, u64)>,
    token_sum: u128,
}

impl SlidingWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&at) = self.requests.front() {
            if at + window > now {
                break;
            }
            self.requests.pop_front();
        }
        while let Some(&(at, cost)) = self.tokens.front() {
            if at + window > now {
                break;
            }
            self.token_sum -= u128::from(cost);
            self.tokens.pop_front();
        }
    }

    pub(crate) fn check(&mut self, now: Instant, config: &RateLimitConfig, cost: u64) -> Admission {
        if config.max_requests_per_window == 0 || cost > config.max_tokens_per_window {
            return Admission::Impossible;
        }

        self.prune(now, config.window);

        let mut wait = Duration::ZERO;

        let max_requests = config.max_requests_per_window as usize;
        if self.requests.len() >= max_requests {
            // Entries are time-ordered, so the one that must leave is at a fixed index.
            let blocking = self.requests.len() - max_requests;
            let exits_at = self.requests[blocking] + config.window;
            wait = wait.max(exits_at.saturating_duration_since(now));
        }

        let cost_wide = u128::from(cost);
        let budget = u128::from(config.max_tokens_per_window);
        if self.token_sum + cost_wide > budget {
            let mut remaining = self.token_sum;
            for &(at, entry_cost) in &self.tokens {
                remaining -= u128::from(entry_cost);
                if remaining + cost_wide <= budget {
                    let exits_at = at + config.window;
                    wait = wait.max(exits_at.saturating_duration_since(now));
                    break;
                }
            }
        }

        if wait.is_zero() {
            Admission::Ready
        } else {
            Admission::Wait(wait)
        }
    }

    pub(crate) fn record(&mut self, now: Instant, cost: u64) {
        self.requests.push_back(now);
        self.tokens.push_back((now, cost));
        self.token_sum += u128::from(cost);
    }

    fn usage(&mut self, now: Instant, window: Duration) -> (usize, u64) {
        self.prune(now, window);
        let tokens = u64::try_from(self.token_sum).unwrap_or(u64::MAX);
        (self.requests.len(), tokens)
    }
}

/// Sliding-window limiter for a single dependency.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    config: RateLimitConfig,
    window: Mutex<SlidingWindow>,
    total_admitted: AtomicU64,
    total_waited: AtomicU64,
    total_rejected: AtomicU64,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            window: Mutex::new(SlidingWindow::default()),
            total_admitted: AtomicU64::new(0),
            total_waited: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Suspend until a call of `cost` tokens fits both budgets, then record it.
    ///
    /// Check and record happen under one lock, so concurrent callers cannot both squeeze into
    /// the last slot.
    pub async fn acquire(&self, cost: u64) -> Result<(), RateLimitError> {
        self.admit(cost, true).await
    }

    /// Suspend until a call of `cost` tokens would fit, without recording it.
    ///
    /// Pair with [`record_request`](Self::record_request) once the request is actually sent.
    pub async fn wait_for_capacity(&self, cost: u64) -> Result<(), RateLimitError> {
        self.admit(cost, false).await
    }

    /// Charge one outbound request of `cost` tokens against the window.
    pub fn record_request(&self, cost: u64) {
        self.window.lock().record(Instant::now(), cost);
        self.total_admitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Fail-fast admission: record and return `Ok` if the call fits now, otherwise report how
    /// long the caller would have to wait.
    pub fn try_acquire(&self, cost: u64) -> Result<(), RateLimitError> {
        let now = Instant::now();
        let mut window = self.window.lock();

        match window.check(now, &self.config, cost) {
            Admission::Ready => {
                window.record(now, cost);
                self.total_admitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Admission::Wait(retry_after) => Err(self.reject_exceeded(retry_after)),
            Admission::Impossible => Err(self.reject_impossible(cost)),
        }
    }

    /// Fail-fast check that a call of `cost` tokens fits right now, without recording it.
    pub fn check_capacity(&self, cost: u64) -> Result<(), RateLimitError> {
        let now = Instant::now();
        match self.window.lock().check(now, &self.config, cost) {
            Admission::Ready => Ok(()),
            Admission::Wait(retry_after) => Err(self.reject_exceeded(retry_after)),
            Admission::Impossible => Err(self.reject_impossible(cost)),
        }
    }

    async fn admit(&self, cost: u64, record: bool) -> Result<(), RateLimitError> {
        let mut waited = false;

        loop {
            let wait = {
                let now = Instant::now();
                let mut window = self.window.lock();

                match window.check(now, &self.config, cost) {
                    Admission::Ready => {
                        if record {
                            window.record(now, cost);
                            self.total_admitted.fetch_add(1, Ordering::Relaxed);
                        }
                        if waited {
                            self.total_waited.fetch_add(1, Ordering::Relaxed);
                        }
                        return Ok(());
                    }
                    Admission::Wait(wait) => wait,
                    Admission::Impossible => return Err(self.reject_impossible(cost)),
                }
            };

            if !waited {
                metrics::counter!("rate_limiter_waits_total", "limiter" => self.name.clone())
                    .increment(1);
            }
            debug!(
                limiter = %self.name,
                cost,
                wait_ms = wait.as_millis() as u64,
                "rate_limit_wait"
            );

            waited = true;
            // Another caller may take the freed slot first; the loop re-checks.
            tokio::time::sleep(wait).await;
        }
    }

    fn reject_exceeded(&self, retry_after: Duration) -> RateLimitError {
        self.total_rejected.fetch_add(1, Ordering::Relaxed);
        RateLimitError::Exceeded {
            name: self.name.clone(),
            retry_after,
        }
    }

    fn reject_impossible(&self, cost: u64) -> RateLimitError {
        self.total_rejected.fetch_add(1, Ordering::Relaxed);
        if self.config.max_requests_per_window == 0 {
            return RateLimitError::NoRequestBudget {
                name: self.name.clone(),
            };
        }
        RateLimitError::CostExceedsBudget {
            name: self.name.clone(),
            cost,
            budget: self.config.max_tokens_per_window,
        }
    }

    pub fn stats(&self) -> RateLimitStats {
        let (requests_in_window, tokens_in_window) = self
            .window
            .lock()
            .usage(Instant::now(), self.config.window);

        RateLimitStats {
            requests_in_window,
            tokens_in_window,
            total_admitted: self.total_admitted.load(Ordering::Relaxed),
            total_waited: self.total_waited.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Statistics for a rate limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStats {
    pub requests_in_window: usize,
    pub tokens_in_window: u64,
    pub total_admitted: u64,
    pub total_waited: u64,
    pub total_rejected: u64,
}

impl RateLimitStats {
    /// Calculate rejection rate (0.0 to 1.0).
    pub fn rejection_rate(&self) -> f64 {
        let total = self.total_admitted + self.total_rejected;
        if total == 0 {
            0.0
        } else {
            self.total_rejected as f64 / total as f64
        }
    }

    /// Calculate wait rate (0.0 to 1.0).
    pub fn wait_rate(&self) -> f64 {
        if self.total_admitted == 0 {
            0.0
        } else {
            self.total_waited as f64 / self.total_admitted as f64
        }
    }
}

/// Registry of rate limiters (one per dependency).
#[derive(Debug)]
pub struct RateLimiterRegistry {
    limiters: DashMap<String, Arc<RateLimiter>>,
    default_config: RateLimitConfig,
}

impl RateLimiterRegistry {
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            limiters: DashMap::new(),
            default_config,
        }
    }

    /// Get or create the limiter for a dependency.
    pub fn get_or_create(&self, name: &str) -> Arc<RateLimiter> {
        self.get_or_create_with_config(name, self.default_config)
    }

    /// Get or create the limiter for a dependency with a custom config (first creation wins).
    pub fn get_or_create_with_config(&self, name: &str, config: RateLimitConfig) -> Arc<RateLimiter> {
        if let Some(existing) = self.limiters.get(name) {
            return Arc::clone(existing.value());
        }

        self.limiters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::new(name, config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Stats for every limiter, sorted by name.
    pub fn all_stats(&self) -> Vec<(String, RateLimitStats)> {
        let mut stats: Vec<_> = self
            .limiters
            .iter()
            .map(|entry| {
                let (name, limiter) = entry.pair();
                (name.clone(), limiter.stats())
            })
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

/// Rate limit configs for the platform's dependencies.
pub mod presets {
    use super::*;

    /// LLM copywriting provider: request and token budgets per minute.
    pub fn llm_provider() -> RateLimitConfig {
        RateLimitConfig {
            max_requests_per_window: 60,
            max_tokens_per_window: 150_000,
            window: Duration::from_secs(60),
        }
    }

    /// Geocoding / places lookups. Calls are not token-metered.
    pub fn places_api() -> RateLimitConfig {
        RateLimitConfig {
            max_requests_per_window: 600,
            max_tokens_per_window: u64::MAX,
            window: Duration::from_secs(60),
        }
    }

    /// Payment processor API, kept well under the provider's per-second ceiling.
    pub fn payments() -> RateLimitConfig {
        RateLimitConfig {
            max_requests_per_window: 25,
            max_tokens_per_window: u64::MAX,
            window: Duration::from_secs(1),
        }
    }
}
