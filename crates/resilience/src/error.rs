use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tagged classification of a failed outbound call.
///
/// Transport adapters map whatever their client reports (status codes, io errors, provider
/// error bodies) onto one of these so retry decisions never depend on error strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Upstream asked us to slow down (HTTP 429).
    RateLimited,
    /// Server-side failure (HTTP 5xx).
    ServerError,
    /// The request or connection timed out.
    Timeout,
    /// Connection refused/reset or another transport-level failure.
    Transport,
    /// Provider-reported overload (e.g. an "overloaded" error body or HTTP 529).
    TransientOverload,
    /// Validation, authentication, malformed request. Never retried.
    Permanent,
}

impl FailureKind {
    /// Whether a failure of this kind is worth another attempt.
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureKind::Permanent)
    }

    /// Map an HTTP status code onto a failure kind.
    pub fn from_status(status: u16) -> Self {
        match status {
            408 => FailureKind::Timeout,
            429 => FailureKind::RateLimited,
            529 => FailureKind::TransientOverload,
            500..=599 => FailureKind::ServerError,
            _ => FailureKind::Permanent,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::RateLimited => "rate_limited",
            FailureKind::ServerError => "server_error",
            FailureKind::Timeout => "timeout",
            FailureKind::Transport => "transport",
            FailureKind::TransientOverload => "transient_overload",
            FailureKind::Permanent => "permanent",
        }
    }
}

/// Implemented by every error type that flows through the resilience layer.
pub trait Classify {
    /// The tagged kind of this failure.
    fn failure_kind(&self) -> FailureKind;

    /// Provider-supplied hint for how long to back off (e.g. a `Retry-After` header).
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Ready-made error type for HTTP-style transport adapters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// HTTP 429 or an equivalent provider throttle.
    #[error("rate limited by upstream: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    /// HTTP 5xx.
    #[error("upstream server error {status}: {message}")]
    Server { status: u16, message: String },
    /// Request or connect timeout.
    #[error("request timed out: {0}")]
    Timeout(String),
    /// Connection refused, reset or otherwise broken.
    #[error("connection failure: {0}")]
    Connection(String),
    /// Provider reported it is temporarily overloaded.
    #[error("provider overloaded: {0}")]
    Overloaded(String),
    /// Any other non-success status: bad request, auth failure, not found.
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl TransportError {
    /// Build an error from a non-success HTTP status and its body/message.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match FailureKind::from_status(status) {
            FailureKind::RateLimited => TransportError::RateLimited {
                message,
                retry_after: None,
            },
            FailureKind::Timeout => TransportError::Timeout(message),
            FailureKind::TransientOverload => TransportError::Overloaded(message),
            FailureKind::ServerError => TransportError::Server { status, message },
            FailureKind::Transport | FailureKind::Permanent => {
                TransportError::Rejected { status, message }
            }
        }
    }

    /// Attach a `Retry-After` hint. Only meaningful on [`TransportError::RateLimited`].
    pub fn with_retry_after(self, hint: Duration) -> Self {
        match self {
            TransportError::RateLimited { message, .. } => TransportError::RateLimited {
                message,
                retry_after: Some(hint),
            },
            other => other,
        }
    }
}

impl Classify for TransportError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            TransportError::RateLimited { .. } => FailureKind::RateLimited,
            TransportError::Server { .. } => FailureKind::ServerError,
            TransportError::Timeout(_) => FailureKind::Timeout,
            TransportError::Connection(_) => FailureKind::Transport,
            TransportError::Overloaded(_) => FailureKind::TransientOverload,
            TransportError::Rejected { .. } => FailureKind::Permanent,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// A breaker refused to admit the call. The operation was never invoked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit '{name}' is open; retry after {retry_after:?}")]
pub struct CircuitOpenError {
    /// Dependency name of the refusing breaker.
    pub name: String,
    /// Time remaining until the breaker will admit a probe.
    pub retry_after: Duration,
    /// Wall-clock moment the breaker will admit a probe.
    pub retry_at: DateTime<Utc>,
}

/// Rate limiter refusals. Only surfaced in fail-fast mode or for impossible costs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded for '{name}'; retry after {retry_after:?}")]
    Exceeded { name: String, retry_after: Duration },
    #[error("cost {cost} exceeds the token budget of {budget} for '{name}'")]
    CostExceedsBudget { name: String, cost: u64, budget: u64 },
    #[error("rate limiter for '{name}' allows no requests per window")]
    NoRequestBudget { name: String },
}

/// Outcome of a single [`CircuitBreaker::execute`](crate::CircuitBreaker::execute).
#[derive(Debug, Error)]
pub enum CallError<E> {
    #[error(transparent)]
    Open(#[from] CircuitOpenError),
    /// The operation ran and failed; the error is passed through untouched.
    #[error("{0}")]
    Failed(E),
}

/// Classified failure returned by [`ResilientInvoker::run_guarded`](crate::ResilientInvoker::run_guarded).
#[derive(Debug, Error)]
pub enum GuardError<E> {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last_error: E,
    },
    /// The caller's cancellation token fired before the call completed.
    #[error("guarded call cancelled")]
    Cancelled,
    /// Non-retryable failure from the operation itself.
    #[error("{0}")]
    Operation(E),
}

impl<E> GuardError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, GuardError::CircuitOpen(_))
    }

    /// How long the caller should hold off before trying this dependency again.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GuardError::CircuitOpen(open) => Some(open.retry_after),
            GuardError::RateLimited(RateLimitError::Exceeded { retry_after, .. }) => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    /// The operation's own error, if the failure came from the operation.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            GuardError::Operation(err) | GuardError::RetryExhausted { last_error: err, .. } => {
                Some(err)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_kinds() {
        assert_eq!(FailureKind::from_status(429), FailureKind::RateLimited);
        assert_eq!(FailureKind::from_status(500), FailureKind::ServerError);
        assert_eq!(FailureKind::from_status(503), FailureKind::ServerError);
        assert_eq!(FailureKind::from_status(529), FailureKind::TransientOverload);
        assert_eq!(FailureKind::from_status(408), FailureKind::Timeout);
        assert_eq!(FailureKind::from_status(400), FailureKind::Permanent);
        assert_eq!(FailureKind::from_status(401), FailureKind::Permanent);
        assert_eq!(FailureKind::from_status(404), FailureKind::Permanent);
    }

    #[test]
    fn only_permanent_is_fatal() {
        assert!(FailureKind::RateLimited.is_retryable());
        assert!(FailureKind::ServerError.is_retryable());
        assert!(FailureKind::Timeout.is_retryable());
        assert!(FailureKind::Transport.is_retryable());
        assert!(FailureKind::TransientOverload.is_retryable());
        assert!(!FailureKind::Permanent.is_retryable());
    }

    #[test]
    fn transport_error_from_status() {
        let err = TransportError::from_status(503, "unavailable");
        assert_eq!(err.failure_kind(), FailureKind::ServerError);
        assert!(err.to_string().contains("503"));

        let err = TransportError::from_status(401, "bad key");
        assert_eq!(err.failure_kind(), FailureKind::Permanent);
        assert!(err.to_string().contains("bad key"));
    }

    #[test]
    fn retry_after_hint_only_on_rate_limited() {
        let err = TransportError::from_status(429, "slow down")
            .with_retry_after(Duration::from_secs(2));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));

        let err = TransportError::Timeout("read".into()).with_retry_after(Duration::from_secs(2));
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn circuit_open_display() {
        let err = CircuitOpenError {
            name: "payments".into(),
            retry_after: Duration::from_secs(5),
            retry_at: Utc::now(),
        };
        assert!(err.to_string().contains("payments"));
        assert!(err.to_string().contains("open"));
    }

    #[test]
    fn guard_error_accessors() {
        let open: GuardError<TransportError> = CircuitOpenError {
            name: "llm-provider".into(),
            retry_after: Duration::from_millis(750),
            retry_at: Utc::now(),
        }
        .into();
        assert!(open.is_circuit_open());
        assert_eq!(open.retry_after(), Some(Duration::from_millis(750)));
        assert!(open.into_operation_error().is_none());

        let exhausted = GuardError::RetryExhausted {
            attempts: 3,
            last_error: TransportError::Timeout("slow".into()),
        };
        assert!(exhausted.to_string().contains("3 attempts"));
        assert_eq!(
            exhausted.into_operation_error(),
            Some(TransportError::Timeout("slow".into()))
        );
    }

    #[test]
    fn guard_error_source_chain() {
        use std::error::Error as _;

        let exhausted: GuardError<TransportError> = GuardError::RetryExhausted {
            attempts: 2,
            last_error: TransportError::Connection("reset".into()),
        };
        let source = exhausted.source().expect("source should be the last error");
        assert!(source.to_string().contains("reset"));
    }

    #[test]
    fn failure_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::TransientOverload).unwrap();
        assert_eq!(json, "\"transient_overload\"");
    }
}
