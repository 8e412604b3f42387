//! Error taxonomy for the admission-control core.
//!
//! Policy:
//! - `RateLimited` and `Inner` (non-retryable upstream faults) surface immediately.
//! - `RetryExhausted` surfaces only after the retry budget is spent, carrying the
//!   last underlying causes.
//! - Shared-store outages never appear here: the rate limiter degrades to its
//!   local fallback and reports the outage via `metrics()` only.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Cap the number of stored failures inside `RetryExhausted` to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Implemented by upstream error types that may carry an HTTP-style status code.
///
/// The retry policy uses this to separate caller faults from transient faults:
/// status codes in `[400, 500)` other than 429 are never retried.
pub trait UpstreamStatus {
    /// Status code attached to the error, if any. `None` means a network-level
    /// failure and is treated as transient.
    fn status(&self) -> Option<u16>;
}

/// Default retryability rule for upstream errors.
pub fn is_transient<E: UpstreamStatus>(error: &E) -> bool {
    match error.status() {
        Some(code) if (400..500).contains(&code) && code != 429 => false,
        _ => true,
    }
}

/// Unified error type for admission and upstream-call outcomes.
#[derive(Debug, Clone)]
pub enum GateError<E> {
    /// Admission was rejected by the rate limiter.
    RateLimited {
        /// How long the caller should wait before retrying.
        retry_after: Duration,
        /// The limit in force for the matched tier/route.
        limit: u32,
        /// Tokens remaining after the decision (zero on rejection).
        remaining: u32,
    },
    /// The circuit breaker guarding the upstream dependency is open.
    CircuitOpen { failure_count: usize, open_for: Duration },
    /// All retry attempts were exhausted against a transient fault.
    RetryExhausted { attempts: usize, failures: Arc<Vec<E>> },
    /// A bounded resource (e.g. the session queue) is at capacity.
    CapacityExceeded { resource: &'static str, capacity: usize },
    /// Non-retryable upstream fault, surfaced verbatim.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for GateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { retry_after, limit, remaining } => write!(
                f,
                "rate limit exceeded (limit {}, {} remaining); retry after {:?}",
                limit, remaining, retry_after
            ),
            Self::CircuitOpen { failure_count, open_for } => write!(
                f,
                "upstream temporarily unavailable: circuit open ({} failures, open for {:?})",
                failure_count, open_for
            ),
            Self::RetryExhausted { attempts, failures } => {
                let recorded = failures.len();
                let truncated_note = if recorded < *attempts {
                    format!(" (recorded last {} failures)", recorded)
                } else {
                    String::new()
                };
                if let Some(last) = failures.last() {
                    write!(
                        f,
                        "retry exhausted after {} attempts{}; last error: {}",
                        attempts, truncated_note, last
                    )
                } else {
                    write!(
                        f,
                        "retry exhausted after {} attempts{}; no recorded failures",
                        attempts, truncated_note
                    )
                }
            }
            Self::CapacityExceeded { resource, capacity } => {
                write!(f, "{} capacity exceeded (limit {})", resource, capacity)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GateError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}

impl<E> GateError<E> {
    /// Construct a `RetryExhausted` variant, keeping only the most recent
    /// `MAX_RETRY_FAILURES` failures.
    pub fn retry_exhausted(attempts: usize, failures: Vec<E>) -> Self {
        let trimmed = if failures.len() > MAX_RETRY_FAILURES {
            failures.into_iter().rev().take(MAX_RETRY_FAILURES).rev().collect()
        } else {
            failures
        };
        GateError::RetryExhausted { attempts, failures: Arc::new(trimmed) }
    }

    /// Check if this error is an admission rejection.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Check if this error is a circuit-open fast failure.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error is due to retry exhaustion.
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// Check if this error is a capacity rejection.
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }

    /// Check if this error wraps a non-retryable upstream fault.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the upstream error if this is an `Inner` variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the upstream error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Retry-after hint for rate-limit rejections, used for response headers.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Access all recorded failures for `RetryExhausted`, if present.
    pub fn failures(&self) -> Option<&[E]> {
        match self {
            Self::RetryExhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::fmt;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct DummyError(&'static str);

    impl fmt::Display for DummyError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for DummyError {}

    struct StatusErr(Option<u16>);
    impl UpstreamStatus for StatusErr {
        fn status(&self) -> Option<u16> {
            self.0
        }
    }

    #[test]
    fn transient_rule_matches_status_classes() {
        assert!(is_transient(&StatusErr(None)), "network errors are transient");
        assert!(is_transient(&StatusErr(Some(429))), "429 is transient");
        assert!(is_transient(&StatusErr(Some(500))));
        assert!(is_transient(&StatusErr(Some(503))));
        assert!(!is_transient(&StatusErr(Some(400))));
        assert!(!is_transient(&StatusErr(Some(404))));
        assert!(!is_transient(&StatusErr(Some(422))));
    }

    #[test]
    fn rate_limited_display_includes_hint() {
        let err: GateError<DummyError> = GateError::RateLimited {
            retry_after: Duration::from_secs(3),
            limit: 60,
            remaining: 0,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("rate limit exceeded"));
        assert!(msg.contains("60"));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn circuit_open_display() {
        let err: GateError<DummyError> =
            GateError::CircuitOpen { failure_count: 5, open_for: Duration::from_secs(30) };
        let msg = format!("{}", err);
        assert!(msg.contains("temporarily unavailable"));
        assert!(msg.contains("5"));
    }

    #[test]
    fn capacity_display_names_resource() {
        let err: GateError<DummyError> =
            GateError::CapacityExceeded { resource: "session queue", capacity: 100 };
        let msg = format!("{}", err);
        assert!(msg.contains("session queue"));
        assert!(msg.contains("100"));
        assert!(err.is_capacity_exceeded());
    }

    #[test]
    fn retry_exhausted_caps_failure_history() {
        let failures: Vec<DummyError> = (0..20).map(|_| DummyError("boom")).collect();
        let err = GateError::retry_exhausted(20, failures);
        match err {
            GateError::RetryExhausted { attempts, failures } => {
                assert_eq!(attempts, 20);
                assert_eq!(failures.len(), MAX_RETRY_FAILURES);
            }
            e => panic!("expected RetryExhausted, got {:?}", e),
        }
    }

    #[test]
    fn retry_exhausted_display_includes_last_error() {
        let err: GateError<DummyError> =
            GateError::retry_exhausted(3, vec![DummyError("first"), DummyError("last")]);
        let msg = format!("{}", err);
        assert!(msg.contains("3"));
        assert!(msg.contains("last error"));
        assert!(msg.contains("last"));
    }

    #[test]
    fn retry_exhausted_display_handles_empty_failures() {
        let err: GateError<DummyError> = GateError::retry_exhausted(3, vec![]);
        let msg = format!("{}", err);
        assert!(msg.contains("no recorded failures"));
    }

    #[test]
    fn source_points_at_last_failure() {
        let err: GateError<DummyError> =
            GateError::retry_exhausted(2, vec![DummyError("a"), DummyError("b")]);
        let source = err.source().expect("source");
        assert_eq!(source.to_string(), "b");

        let inner = GateError::Inner(DummyError("x"));
        assert_eq!(inner.source().expect("source").to_string(), "x");
    }

    #[test]
    fn predicates_cover_all_variants() {
        let limited: GateError<DummyError> = GateError::RateLimited {
            retry_after: Duration::from_secs(1),
            limit: 10,
            remaining: 0,
        };
        assert!(limited.is_rate_limited());
        assert!(!limited.is_circuit_open());

        let open: GateError<DummyError> =
            GateError::CircuitOpen { failure_count: 1, open_for: Duration::ZERO };
        assert!(open.is_circuit_open());

        let exhausted: GateError<DummyError> = GateError::retry_exhausted(1, vec![]);
        assert!(exhausted.is_retry_exhausted());

        let inner = GateError::Inner(DummyError("x"));
        assert!(inner.is_inner());
        assert_eq!(inner.into_inner().unwrap().0, "x");
    }
}
