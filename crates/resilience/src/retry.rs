//! Retry logic with exponential backoff for transient failures.
//!
//! Classification is done on [`FailureKind`](crate::FailureKind) tags, never on error text.
//! Only rate limiting, server errors, timeouts/transport failures and provider overload are
//! retried; everything else is returned on the first occurrence.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::error::Classify;

/// Randomization applied on top of the exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// Plain `min(base * 2^n, max)`.
    None,
    /// Uniform in `[0, backoff]`.
    Full,
    /// Uniform in `[backoff / 2, backoff]`.
    #[default]
    Equal,
    /// Uniform in `[base, 3 * previous]`, capped at `max_delay`.
    Decorrelated,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Backoff base in milliseconds.
    #[serde(with = "crate::serde_millis")]
    pub base_delay: Duration,
    /// Upper bound on any single backoff, in milliseconds.
    #[serde(with = "crate::serde_millis")]
    pub max_delay: Duration,
    pub jitter: Jitter,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter: Jitter::default(),
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Result of a retried operation.
#[derive(Debug, Clone)]
pub struct RetryResult<T, E> {
    /// The final result (success or the last error).
    pub result: Result<T, E>,
    /// Number of attempts made (1 = first try settled it).
    pub attempts: u32,
    /// Total time spent including backoff sleeps.
    pub total_duration: Duration,
    /// True when the last error was retryable but the retry budget ran out.
    pub exhausted: bool,
}

impl<T, E> RetryResult<T, E> {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// Stateless retry policy. Per-call state (attempt index, previous delay) lives in the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether another attempt should follow a failure at `attempt` (0-indexed).
    pub fn should_retry<E: Classify + ?Sized>(&self, error: &E, attempt: u32) -> bool {
        attempt < self.config.max_retries && error.failure_kind().is_retryable()
    }

    /// Unjittered backoff after a failure at `attempt`: `min(base * 2^attempt, max_delay)`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_millis() as u64;
        let max = self.config.max_delay.as_millis() as u64;
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(base.saturating_mul(factor).min(max))
    }

    /// Backoff with jitter applied. `previous` is the delay used before the last attempt, if any.
    pub fn delay_for(&self, attempt: u32, previous: Option<Duration>) -> Duration {
        let backoff = self.next_delay(attempt).as_millis() as u64;
        let max = self.config.max_delay.as_millis() as u64;

        let millis = match self.config.jitter {
            Jitter::None => backoff,
            Jitter::Full => fastrand::u64(0..=backoff),
            Jitter::Equal => backoff / 2 + fastrand::u64(0..=backoff - backoff / 2),
            Jitter::Decorrelated => {
                let base = (self.config.base_delay.as_millis() as u64).min(max);
                let previous = previous.map_or(base, |d| d.as_millis() as u64);
                let upper = previous.saturating_mul(3).max(base);
                fastrand::u64(base..=upper).min(max)
            }
        };

        Duration::from_millis(millis)
    }

    /// Delay before retrying `error`, honouring a provider `retry_after` hint up to `max_delay`.
    pub fn delay_for_error<E: Classify + ?Sized>(
        &self,
        error: &E,
        attempt: u32,
        previous: Option<Duration>,
    ) -> Duration {
        let delay = self.delay_for(attempt, previous);
        match error.retry_after() {
            Some(hint) => delay.max(hint).min(self.config.max_delay),
            None => delay,
        }
    }

    /// Run `operation` until it succeeds, fails permanently, or the retry budget is spent.
    ///
    /// The closure receives the 0-indexed attempt number. Dropping the returned future cancels
    /// any pending backoff sleep.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> RetryResult<T, E>
    where
        E: Classify + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        let mut previous = None;
        let mut attempt = 0;

        loop {
            let error = match operation(attempt).await {
                Ok(value) => {
                    return RetryResult {
                        result: Ok(value),
                        attempts: attempt + 1,
                        total_duration: start.elapsed(),
                        exhausted: false,
                    };
                }
                Err(error) => error,
            };

            let kind = error.failure_kind();
            if !self.should_retry(&error, attempt) {
                return RetryResult {
                    result: Err(error),
                    attempts: attempt + 1,
                    total_duration: start.elapsed(),
                    exhausted: kind.is_retryable(),
                };
            }

            let delay = self.delay_for_error(&error, attempt, previous);
            metrics::counter!("retry_policy_retries_total", "kind" => kind.as_str()).increment(1);
            debug!(
                attempt,
                kind = kind.as_str(),
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retry_scheduled"
            );

            tokio::time::sleep(delay).await;
            previous = Some(delay);
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use proptest::prelude::*;

    fn policy(max_retries: u32, base_ms: u64, max_ms: u64, jitter: Jitter) -> RetryPolicy {
        RetryPolicy::new(
            RetryConfig::default()
                .with_max_retries(max_retries)
                .with_base_delay(Duration::from_millis(base_ms))
                .with_max_delay(Duration::from_millis(max_ms))
                .with_jitter(jitter),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_eventually() {
        let policy = policy(3, 100, 10_000, Jitter::None);
        let mut calls = 0;

        let result = policy
            .execute(|_attempt| {
                calls += 1;
                let outcome = if calls < 3 {
                    Err(TransportError::Connection("reset".into()))
                } else {
                    Ok("success")
                };
                async move { outcome }
            })
            .await;

        assert!(result.succeeded());
        assert_eq!(result.attempts, 3);
        // 100ms + 200ms of backoff
        assert!(result.total_duration >= Duration::from_millis(300));
        assert!(result.total_duration < Duration::from_millis(310));
        assert_eq!(result.into_result().unwrap(), "success");
    }

    #[tokio::test(start_paused = true)]
    async fn retry_fails_after_max_attempts() {
        let policy = policy(2, 10, 1_000, Jitter::None);

        let result: RetryResult<(), _> = policy
            .execute(|_| async { Err(TransportError::from_status(503, "unavailable")) })
            .await;

        assert!(!result.succeeded());
        assert!(result.exhausted);
        assert_eq!(result.attempts, 3); // Initial + 2 retries
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let policy = policy(5, 10, 1_000, Jitter::None);

        let result: RetryResult<(), _> = policy
            .execute(|_| async { Err(TransportError::from_status(401, "invalid api key")) })
            .await;

        assert_eq!(result.attempts, 1);
        assert!(!result.exhausted);
        assert_eq!(result.total_duration, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_no_delay_on_success() {
        let policy = RetryPolicy::default();
        let result = policy
            .execute(|_| async { Ok::<_, TransportError>("immediate success") })
            .await;

        assert!(result.succeeded());
        assert_eq!(result.attempts, 1);
        assert_eq!(result.total_duration, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_stretches_delay() {
        let policy = policy(1, 100, 5_000, Jitter::None);

        let result: RetryResult<(), _> = policy
            .execute(|_| async {
                Err(TransportError::from_status(429, "slow down")
                    .with_retry_after(Duration::from_secs(2)))
            })
            .await;

        assert_eq!(result.attempts, 2);
        assert!(result.total_duration >= Duration::from_secs(2));
        assert!(result.total_duration < Duration::from_millis(2_010));
    }

    #[test]
    fn next_delay_doubles_then_caps() {
        let policy = policy(10, 100, 1_000, Jitter::None);
        assert_eq!(policy.next_delay(0), Duration::from_millis(100));
        assert_eq!(policy.next_delay(1), Duration::from_millis(200));
        assert_eq!(policy.next_delay(2), Duration::from_millis(400));
        assert_eq!(policy.next_delay(3), Duration::from_millis(800));
        assert_eq!(policy.next_delay(4), Duration::from_millis(1_000));
        assert_eq!(policy.next_delay(63), Duration::from_millis(1_000));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn default_config_values() {
        let cfg = RetryConfig::default();
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.base_delay, Duration::from_millis(1000));
        assert_eq!(cfg.max_delay, Duration::from_millis(30_000));
        assert_eq!(cfg.jitter, Jitter::Equal);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for jitter in [Jitter::Full, Jitter::Equal, Jitter::Decorrelated] {
            let policy = policy(10, 100, 2_000, jitter);
            let mut previous = None;
            for attempt in 0..10 {
                let delay = policy.delay_for(attempt, previous);
                assert!(delay <= Duration::from_millis(2_000), "{jitter:?}: {delay:?}");
                if jitter == Jitter::Equal {
                    assert!(delay >= policy.next_delay(attempt) / 2);
                }
                if jitter == Jitter::Decorrelated {
                    assert!(delay >= Duration::from_millis(100));
                }
                previous = Some(delay);
            }
        }
    }

    #[test]
    fn config_deserializes_millis() {
        let cfg: RetryConfig = serde_json::from_str(
            r#"{"max_retries": 2, "base_delay": 100, "max_delay": 1000, "jitter": "none"}"#,
        )
        .unwrap();
        assert_eq!(cfg.base_delay, Duration::from_millis(100));
        assert_eq!(cfg.jitter, Jitter::None);
    }

    proptest! {
        #[test]
        fn next_delay_is_monotonic_and_bounded(
            base_ms in 0u64..5_000,
            max_ms in 0u64..60_000,
            attempt in 0u32..128,
        ) {
            let policy = policy(3, base_ms, max_ms, Jitter::None);
            let current = policy.next_delay(attempt);
            let next = policy.next_delay(attempt + 1);
            prop_assert!(current <= next);
            prop_assert!(next <= Duration::from_millis(max_ms));
        }

        #[test]
        fn never_retries_past_budget(max_retries in 0u32..10, extra in 0u32..100, status in 400u16..600) {
            let policy = policy(max_retries, 10, 100, Jitter::None);
            let error = TransportError::from_status(status, "any");
            prop_assert!(!policy.should_retry(&error, max_retries + extra));
        }
    }
}
