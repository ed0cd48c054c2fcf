//! Composition point: rate limit → circuit breaker → retry, per dependency.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats};
use crate::error::{Classify, GuardError};
use crate::rate_limit::{RateLimitConfig, RateLimitStats, RateLimiterRegistry};
use crate::retry::{RetryConfig, RetryPolicy};

/// How a dependency's rate limiter treats a call that does not fit the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitMode {
    /// Suspend until capacity frees up.
    #[default]
    Wait,
    /// Return [`RateLimitError::Exceeded`](crate::RateLimitError::Exceeded) immediately.
    FailFast,
}

/// Breaker, limiter and retry settings for one dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyPolicy {
    pub breaker: CircuitBreakerConfig,
    /// `None` disables rate limiting for the dependency.
    pub rate_limit: Option<RateLimitConfig>,
    pub rate_limit_mode: RateLimitMode,
    pub retry: RetryConfig,
}

impl Default for DependencyPolicy {
    fn default() -> Self {
        Self {
            breaker: CircuitBreakerConfig::default(),
            rate_limit: Some(RateLimitConfig::default()),
            rate_limit_mode: RateLimitMode::Wait,
            retry: RetryConfig::default(),
        }
    }
}

impl DependencyPolicy {
    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn without_rate_limit(mut self) -> Self {
        self.rate_limit = None;
        self
    }

    pub fn with_rate_limit_mode(mut self, mode: RateLimitMode) -> Self {
        self.rate_limit_mode = mode;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Policies for the platform's outbound dependencies.
pub mod presets {
    use std::time::Duration;

    use super::*;
    use crate::rate_limit::presets as limits;

    pub const LLM_PROVIDER: &str = "llm-provider";
    pub const PAYMENTS: &str = "payments";
    pub const PLACES_API: &str = "places-api";
    pub const DATASTORE: &str = "datastore";

    /// Copy generation. Slow, token-metered, prone to overload responses.
    pub fn llm_provider() -> DependencyPolicy {
        DependencyPolicy {
            breaker: CircuitBreakerConfig::default(),
            rate_limit: Some(limits::llm_provider()),
            rate_limit_mode: RateLimitMode::Wait,
            retry: RetryConfig::default(),
        }
    }

    /// Checkout path: never queue behind the limiter, trip early, retry little.
    pub fn payments() -> DependencyPolicy {
        DependencyPolicy {
            breaker: CircuitBreakerConfig::default()
                .with_failure_threshold(3)
                .with_open_timeout(Duration::from_secs(60)),
            rate_limit: Some(limits::payments()),
            rate_limit_mode: RateLimitMode::FailFast,
            retry: RetryConfig::default()
                .with_max_retries(2)
                .with_base_delay(Duration::from_millis(500))
                .with_max_delay(Duration::from_secs(5)),
        }
    }

    pub fn places_api() -> DependencyPolicy {
        DependencyPolicy {
            breaker: CircuitBreakerConfig::default(),
            rate_limit: Some(limits::places_api()),
            rate_limit_mode: RateLimitMode::Wait,
            retry: RetryConfig::default()
                .with_base_delay(Duration::from_millis(250))
                .with_max_delay(Duration::from_secs(5)),
        }
    }

    /// Primary datastore. Not rate limited; short cooldown so recovery is noticed quickly.
    pub fn datastore() -> DependencyPolicy {
        DependencyPolicy {
            breaker: CircuitBreakerConfig::default()
                .with_failure_threshold(10)
                .with_open_timeout(Duration::from_secs(10)),
            rate_limit: None,
            rate_limit_mode: RateLimitMode::Wait,
            retry: RetryConfig::default()
                .with_max_retries(2)
                .with_base_delay(Duration::from_millis(50))
                .with_max_delay(Duration::from_secs(1)),
        }
    }

    /// Every preset keyed by dependency name.
    pub fn all() -> Vec<(&'static str, DependencyPolicy)> {
        vec![
            (LLM_PROVIDER, llm_provider()),
            (PAYMENTS, payments()),
            (PLACES_API, places_api()),
            (DATASTORE, datastore()),
        ]
    }
}

/// Runs outbound calls under their dependency's rate limiter, breaker and retry policy.
///
/// Each attempt, retries included, is charged against the limiter and must pass the breaker's
/// admission check, so a breaker that opens halfway through a retry sequence ends it.
#[derive(Debug)]
pub struct ResilientInvoker {
    breakers: Arc<CircuitBreakerRegistry>,
    limiters: Arc<RateLimiterRegistry>,
    policies: DashMap<String, DependencyPolicy>,
    default_policy: DependencyPolicy,
}

impl ResilientInvoker {
    /// Invoker with fresh registries.
    pub fn new(default_policy: DependencyPolicy) -> Self {
        Self::with_registries(
            Arc::new(CircuitBreakerRegistry::new(default_policy.breaker)),
            Arc::new(RateLimiterRegistry::new(
                default_policy.rate_limit.unwrap_or_default(),
            )),
            default_policy,
        )
    }

    /// Invoker sharing registries with other components.
    pub fn with_registries(
        breakers: Arc<CircuitBreakerRegistry>,
        limiters: Arc<RateLimiterRegistry>,
        default_policy: DependencyPolicy,
    ) -> Self {
        Self {
            breakers,
            limiters,
            policies: DashMap::new(),
            default_policy,
        }
    }

    pub fn with_policy(self, name: impl Into<String>, policy: DependencyPolicy) -> Self {
        self.set_policy(name, policy);
        self
    }

    /// Register every policy in [`presets`].
    pub fn with_presets(self) -> Self {
        for (name, policy) in presets::all() {
            self.set_policy(name, policy);
        }
        self
    }

    /// Set the policy for a dependency.
    ///
    /// Breaker and limiter settings only take effect if that dependency has not been called yet;
    /// retry and rate-limit-mode changes apply to the next call.
    pub fn set_policy(&self, name: impl Into<String>, policy: DependencyPolicy) {
        self.policies.insert(name.into(), policy);
    }

    /// Policy in force for `name`, falling back to the default policy.
    pub fn policy(&self, name: &str) -> DependencyPolicy {
        self.policies
            .get(name)
            .map(|entry| *entry.value())
            .unwrap_or(self.default_policy)
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn rate_limiters(&self) -> &Arc<RateLimiterRegistry> {
        &self.limiters
    }

    pub fn stats(&self, name: &str) -> Option<CircuitBreakerStats> {
        self.breakers.stats(name)
    }

    pub fn all_stats(&self) -> Vec<CircuitBreakerStats> {
        self.breakers.all_stats()
    }

    pub fn rate_limit_stats(&self) -> Vec<(String, RateLimitStats)> {
        self.limiters.all_stats()
    }

    /// Run `operation` against dependency `name`, charging `cost` tokens per attempt.
    ///
    /// `operation` is called once per attempt and only after both the limiter and the breaker
    /// have admitted that attempt. The limiter is charged only for attempts the breaker lets
    /// through, so calls refused while the circuit is open leave the window untouched.
    pub async fn run_guarded<T, E, F, Fut>(
        &self,
        name: &str,
        cost: u64,
        mut operation: F,
    ) -> Result<T, GuardError<E>>
    where
        E: Classify + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let policy = self.policy(name);
        let breaker = self.breakers.get_or_create_with_config(name, policy.breaker);
        let limiter = policy
            .rate_limit
            .map(|config| self.limiters.get_or_create_with_config(name, config));
        let retry = RetryPolicy::new(policy.retry);

        let mut attempt = 0;
        let mut previous_delay = None;

        loop {
            if let Some(limiter) = &limiter {
                match policy.rate_limit_mode {
                    RateLimitMode::Wait => limiter.wait_for_capacity(cost).await?,
                    RateLimitMode::FailFast => limiter.check_capacity(cost)?,
                }
            }

            let permit = match breaker.try_acquire() {
                Ok(permit) => permit,
                Err(open) => {
                    debug!(dependency = name, attempt, "guarded_call_rejected");
                    return Err(GuardError::CircuitOpen(open));
                }
            };

            if let Some(limiter) = &limiter {
                // A concurrent caller may have taken the capacity seen above.
                let charged = match policy.rate_limit_mode {
                    RateLimitMode::Wait => limiter.acquire(cost).await,
                    RateLimitMode::FailFast => limiter.try_acquire(cost),
                };
                if let Err(err) = charged {
                    breaker.release(permit);
                    return Err(err.into());
                }
            }

            let error = match operation().await {
                Ok(value) => {
                    breaker.record_success(permit);
                    if attempt > 0 {
                        info!(dependency = name, attempts = attempt + 1, "guarded_call_recovered");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    breaker.record_failure(permit);
                    error
                }
            };

            let kind = error.failure_kind();
            if !kind.is_retryable() {
                debug!(
                    dependency = name,
                    kind = kind.as_str(),
                    error = %error,
                    "guarded_call_failed"
                );
                return Err(GuardError::Operation(error));
            }

            if !retry.should_retry(&error, attempt) {
                warn!(
                    dependency = name,
                    attempts = attempt + 1,
                    kind = kind.as_str(),
                    error = %error,
                    "retries_exhausted"
                );
                return Err(GuardError::RetryExhausted {
                    attempts: attempt + 1,
                    last_error: error,
                });
            }

            let delay = retry.delay_for_error(&error, attempt, previous_delay);
            metrics::counter!(
                "resilience_retries_total",
                "dependency" => name.to_string(),
                "kind" => kind.as_str()
            )
            .increment(1);
            warn!(
                dependency = name,
                attempt = attempt + 1,
                kind = kind.as_str(),
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying"
            );

            tokio::time::sleep(delay).await;
            previous_delay = Some(delay);
            attempt += 1;
        }
    }

    /// [`run_guarded`](Self::run_guarded) that gives up with [`GuardError::Cancelled`] as soon as
    /// `cancel` fires.
    ///
    /// Cancellation drops the pending rate-limit wait, attempt or backoff sleep. An attempt
    /// dropped mid-flight is not reported to the breaker.
    pub async fn run_guarded_with_cancel<T, E, F, Fut>(
        &self,
        name: &str,
        cost: u64,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, GuardError<E>>
    where
        E: Classify + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(dependency = name, "guarded_call_cancelled");
                Err(GuardError::Cancelled)
            }
            result = self.run_guarded(name, cost, operation) => result,
        }
    }
}

impl Default for ResilientInvoker {
    fn default() -> Self {
        Self::new(DependencyPolicy::default())
    }
}
