//! Outreach Resilience
//!
//! Everything the platform uses to talk to flaky outbound dependencies (the LLM copywriting
//! provider, payments, places lookups, the datastore) without taking the whole pipeline down
//! with them.
//!
//! The pieces:
//!
//! - **Circuit breakers** - one per dependency, kept in a [`CircuitBreakerRegistry`]. After
//!   enough consecutive failures the breaker opens and calls fail fast until a cooldown passes.
//! - **Rate limiters** - sliding-window request and token budgets per dependency. Callers wait
//!   for capacity instead of eating a 429.
//! - **Retry** - exponential backoff with jitter, driven by tagged [`FailureKind`]s. Permanent
//!   failures are never retried.
//! - **[`ResilientInvoker`]** - glues the three together behind `run_guarded`.
//!
//! ## Threading notes
//!
//! Breaker and limiter state sits behind one `parking_lot` mutex each. Locks are never held
//! across an `.await`; waiting is done with `tokio::time::sleep`, so tests can run on a paused
//! clock.
//!
//! ## Quick example
//!
//! ```no_run
//! use resilience::{presets, GuardError, ResilientInvoker, TransportError};
//!
//! #[tokio::main]
//! async fn main() {
//!     let invoker = ResilientInvoker::default().with_presets();
//!
//!     let result: Result<String, GuardError<TransportError>> = invoker
//!         .run_guarded(presets::LLM_PROVIDER, 1_200, || async {
//!             // Call the provider here and map non-2xx responses with
//!             // `TransportError::from_status(status, body)`.
//!             Ok("Spring sale copy".to_string())
//!         })
//!         .await;
//!
//!     match result {
//!         Ok(copy) => println!("{copy}"),
//!         Err(err) if err.is_circuit_open() => println!("provider unavailable: {err}"),
//!         Err(err) => println!("failed: {err}"),
//!     }
//! }
//! ```

pub mod circuit_breaker;
pub mod error;
pub mod invoker;
pub mod rate_limit;
pub mod retry;
mod serde_millis;

pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerStats, CircuitState,
};
pub use error::{
    CallError, CircuitOpenError, Classify, FailureKind, GuardError, RateLimitError,
    TransportError,
};
pub use invoker::{presets, DependencyPolicy, RateLimitMode, ResilientInvoker};
pub use rate_limit::{RateLimitConfig, RateLimitStats, RateLimiter, RateLimiterRegistry};
pub use retry::{Jitter, RetryConfig, RetryPolicy, RetryResult};
