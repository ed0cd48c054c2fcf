//! Workspace umbrella crate for the Outreach platform's outbound-call layer.
//!
//! This crate stitches the resilience primitives together with configuration loading so
//! services can go from a YAML file to a ready [`ResilientInvoker`] via
//! [`OutreachConfig::build_invoker`].

pub mod config;

pub use config::{ConfigLoadError, ENV_PREFIX, OutreachConfig};
pub use resilience::{
    CallError, CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerStats, CircuitOpenError, CircuitState, Classify, DependencyPolicy, FailureKind,
    GuardError, Jitter, RateLimitConfig, RateLimitError, RateLimitMode, RateLimitStats,
    RateLimiter, RateLimiterRegistry, ResilientInvoker, RetryConfig, RetryPolicy, RetryResult,
    TransportError, presets,
};

use serde::Serialize;

/// Point-in-time view of every breaker and limiter an invoker has created.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub breakers: Vec<CircuitBreakerStats>,
    pub rate_limiters: Vec<LimiterReport>,
}

/// One limiter's stats, tagged with its dependency name.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterReport {
    pub name: String,
    #[serde(flatten)]
    pub stats: RateLimitStats,
}

impl HealthReport {
    pub fn collect(invoker: &ResilientInvoker) -> Self {
        Self {
            breakers: invoker.all_stats(),
            rate_limiters: invoker
                .rate_limit_stats()
                .into_iter()
                .map(|(name, stats)| LimiterReport { name, stats })
                .collect(),
        }
    }

    /// Names of dependencies whose breaker is not Closed.
    pub fn unhealthy(&self) -> Vec<&str> {
        self.breakers
            .iter()
            .filter(|stats| stats.state != CircuitState::Closed)
            .map(|stats| stats.name.as_str())
            .collect()
    }
}

/// Install the JSON `tracing` subscriber used by the binaries.
#[cfg(feature = "telemetry")]
pub fn init_tracing(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .json()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn health_report_lists_created_dependencies() {
        let invoker = OutreachConfig::default().build_invoker();

        let _: Result<(), GuardError<TransportError>> = invoker
            .run_guarded(presets::PLACES_API, 1, || async { Ok(()) })
            .await;
        let _: Result<(), GuardError<TransportError>> = invoker
            .run_guarded(presets::DATASTORE, 1, || async { Ok(()) })
            .await;

        let report = HealthReport::collect(&invoker);
        let breakers: Vec<_> = report.breakers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(breakers, vec!["datastore", "places-api"]);
        assert_eq!(report.rate_limiters.len(), 1);
        assert_eq!(report.rate_limiters[0].name, "places-api");
        assert!(report.unhealthy().is_empty());
    }

    #[test]
    fn health_report_serializes_flat_limiter_stats() {
        let report = HealthReport {
            breakers: Vec::new(),
            rate_limiters: vec![LimiterReport {
                name: "llm-provider".into(),
                stats: RateLimitStats::default(),
            }],
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["rate_limiters"][0]["name"], "llm-provider");
        assert_eq!(json["rate_limiters"][0]["requests_in_window"], 0);
    }
}
