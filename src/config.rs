//! YAML Configuration File Support for Outreach
//!
//! Loads the resilience policies for every outbound dependency from one YAML file, optionally
//! overridden by `OUTREACH__*` environment variables. Durations are integer milliseconds.
//!
//! ## Example YAML Configuration
//!
//! ```yaml
//! version: "1.0"
//! name: "production"
//! log_level: "info"
//!
//! # Start from the built-in llm-provider / payments / places-api / datastore policies.
//! use_presets: true
//!
//! # Applied to any dependency without its own entry.
//! defaults:
//!   breaker:
//!     failure_threshold: 5
//!     success_threshold: 2
//!     open_timeout: 30000
//!     reset_window: 60000
//!   rate_limit:
//!     max_requests_per_window: 60
//!     max_tokens_per_window: 150000
//!     window: 60000
//!   rate_limit_mode: "wait"
//!   retry:
//!     max_retries: 3
//!     base_delay: 1000
//!     max_delay: 30000
//!     jitter: "equal"
//!
//! dependencies:
//!   llm-provider:
//!     rate_limit:
//!       max_tokens_per_window: 90000
//!   crm-sync:
//!     rate_limit: null
//!     retry:
//!       max_retries: 1
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use resilience::{
    CircuitBreakerConfig, DependencyPolicy, RateLimitConfig, ResilientInvoker, RetryConfig,
    presets,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Prefix for environment overrides, e.g. `OUTREACH__DEFAULTS__RETRY__MAX_RETRIES=5`.
pub const ENV_PREFIX: &str = "OUTREACH";

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("failed to assemble config sources: {0}")]
    Source(#[from] config::ConfigError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unsupported config version: {0}")]
    UnsupportedVersion(String),
}

/// Top-level configuration for the outreach platform's outbound calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OutreachConfig {
    /// Configuration format version
    pub version: String,

    /// Optional configuration name/description
    #[serde(default)]
    pub name: Option<String>,

    /// `tracing` env-filter directive used by the binary
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Register the built-in dependency presets before applying `dependencies`
    #[serde(default = "true_value")]
    pub use_presets: bool,

    /// Policy for dependencies without an explicit entry
    #[serde(default)]
    pub defaults: DependencyPolicy,

    /// Per-dependency policies, keyed by dependency name
    #[serde(default)]
    pub dependencies: HashMap<String, DependencyPolicy>,
}

impl OutreachConfig {
    /// Load a YAML configuration file from the given path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse YAML configuration from a string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigLoadError> {
        let config: OutreachConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an optional YAML file layered with `OUTREACH__*` environment variables.
    ///
    /// A missing file is not an error; everything then comes from defaults and the environment.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigLoadError> {
        let mut builder = config::Config::builder()
            .set_default("version", "1.0")?
            .set_default("log_level", default_log_level())?
            .set_default("use_presets", true)?;

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path.as_ref())
                    .format(config::FileFormat::Yaml)
                    .required(false),
            );
        }

        let config: OutreachConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        match self.version.as_str() {
            "1.0" | "1" => Ok(()),
            v => Err(ConfigLoadError::UnsupportedVersion(v.to_string())),
        }?;

        validate_policy("defaults", &self.defaults)?;
        for (name, policy) in &self.dependencies {
            if name.trim().is_empty() {
                return Err(ConfigLoadError::Validation(
                    "dependency names must not be empty".into(),
                ));
            }
            validate_policy(name, policy)?;
        }

        Ok(())
    }

    /// Policies in the order they are registered: presets first, then explicit entries.
    pub fn policies(&self) -> Vec<(String, DependencyPolicy)> {
        let mut policies: Vec<(String, DependencyPolicy)> = Vec::new();

        if self.use_presets {
            for (name, policy) in presets::all() {
                if !self.dependencies.contains_key(name) {
                    policies.push((name.to_string(), policy));
                }
            }
        }

        let mut explicit: Vec<_> = self
            .dependencies
            .iter()
            .map(|(name, policy)| (name.clone(), *policy))
            .collect();
        explicit.sort_by(|a, b| a.0.cmp(&b.0));
        policies.extend(explicit);

        policies
    }

    /// Build an invoker with every configured policy registered.
    pub fn build_invoker(&self) -> ResilientInvoker {
        let policies = self.policies();
        let count = policies.len();

        let invoker = policies
            .into_iter()
            .fold(ResilientInvoker::new(self.defaults), |invoker, (name, policy)| {
                invoker.with_policy(name, policy)
            });

        info!(
            config_name = self.name.as_deref().unwrap_or("unnamed"),
            dependencies = count,
            presets = self.use_presets,
            "invoker_ready"
        );
        invoker
    }
}

impl Default for OutreachConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            name: None,
            log_level: default_log_level(),
            use_presets: true,
            defaults: DependencyPolicy::default(),
            dependencies: HashMap::new(),
        }
    }
}

fn validate_policy(name: &str, policy: &DependencyPolicy) -> Result<(), ConfigLoadError> {
    validate_breaker(name, &policy.breaker)?;
    if let Some(rate_limit) = &policy.rate_limit {
        validate_rate_limit(name, rate_limit)?;
    }
    validate_retry(name, &policy.retry)
}

fn validate_breaker(name: &str, breaker: &CircuitBreakerConfig) -> Result<(), ConfigLoadError> {
    if breaker.failure_threshold == 0 {
        return Err(ConfigLoadError::Validation(format!(
            "{name}: breaker.failure_threshold must be >= 1"
        )));
    }
    if breaker.success_threshold == 0 {
        return Err(ConfigLoadError::Validation(format!(
            "{name}: breaker.success_threshold must be >= 1"
        )));
    }
    if breaker.open_timeout.is_zero() {
        return Err(ConfigLoadError::Validation(format!(
            "{name}: breaker.open_timeout must be > 0"
        )));
    }
    Ok(())
}

fn validate_rate_limit(name: &str, rate_limit: &RateLimitConfig) -> Result<(), ConfigLoadError> {
    if rate_limit.max_requests_per_window == 0 {
        return Err(ConfigLoadError::Validation(format!(
            "{name}: rate_limit.max_requests_per_window must be >= 1"
        )));
    }
    if rate_limit.max_tokens_per_window == 0 {
        return Err(ConfigLoadError::Validation(format!(
            "{name}: rate_limit.max_tokens_per_window must be >= 1"
        )));
    }
    if rate_limit.window.is_zero() {
        return Err(ConfigLoadError::Validation(format!(
            "{name}: rate_limit.window must be > 0"
        )));
    }
    Ok(())
}

fn validate_retry(name: &str, retry: &RetryConfig) -> Result<(), ConfigLoadError> {
    if retry.base_delay > retry.max_delay {
        return Err(ConfigLoadError::Validation(format!(
            "{name}: retry.base_delay ({:?}) exceeds retry.max_delay ({:?})",
            retry.base_delay, retry.max_delay
        )));
    }
    Ok(())
}

fn default_log_level() -> String {
    "info".to_string()
}
fn true_value() -> bool {
    true
}
