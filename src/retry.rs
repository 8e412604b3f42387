//! Bounded retry for upstream calls.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - Only transient faults are retried. The default predicate uses
//!   [`UpstreamStatus`]: client errors in `[400, 500)` other than 429 indicate
//!   a caller fault and return immediately; 429, 5xx, and network errors are
//!   retried.
//! - Delay before the n-th attempt (n >= 2) is
//!   `min(base * 2^(n-2) + jitter, max_delay)`; jitter is uniform up to one
//!   second by default so concurrent callers spread out.
//! - The sleeper controls how delays are applied (production uses
//!   `TokioSleeper`; tests inject `InstantSleeper`/`TrackingSleeper`).
//! - An in-flight delay is not cancellable from inside the policy; callers
//!   wanting a deadline race the returned future externally.
//!
//! Invariants:
//! - Attempts never exceed `max_attempts`.
//! - Exhaustion yields [`GateError::RetryExhausted`] with a capped failure history.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use gatehouse::{Backoff, RetryPolicy, UpstreamStatus};
//!
//! #[derive(Debug)]
//! struct ApiError(Option<u16>);
//! impl std::fmt::Display for ApiError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "api error") }
//! }
//! impl std::error::Error for ApiError {}
//! impl UpstreamStatus for ApiError {
//!     fn status(&self) -> Option<u16> { self.0 }
//! }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::<ApiError>::builder()
//!     .max_attempts(3)
//!     .backoff(Backoff::exponential(Duration::from_millis(100)))
//!     .max_delay(Duration::from_secs(5))
//!     .build()
//!     .unwrap();
//! let result = policy.execute(|| async { Err::<(), _>(ApiError(Some(404))) }).await;
//! assert!(result.unwrap_err().is_inner()); // 404 is never retried
//! # });
//! ```

use crate::error::{is_transient, UpstreamStatus, MAX_RETRY_FAILURES};
use crate::{Backoff, GateError, Jitter, Sleeper, TokioSleeper};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Retry policy combining backoff, jitter, retryability predicate, and sleeper.
#[derive(Clone)]
pub struct RetryPolicy<E> {
    max_attempts: usize,
    backoff: Backoff,
    max_delay: Duration,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("should_retry", &"<predicate>")
            .field("sleeper", &"<sleeper>")
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: std::error::Error + UpstreamStatus + Send + Sync + 'static,
{
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }
}

impl<E> RetryPolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Execute an async upstream operation with retry semantics.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, GateError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut failures: VecDeque<E> = VecDeque::new();

        for attempt in 0..self.max_attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !(self.should_retry)(&e) {
                        return Err(GateError::Inner(e));
                    }

                    failures.push_back(e);
                    while failures.len() > MAX_RETRY_FAILURES {
                        failures.pop_front();
                    }

                    if attempt + 1 >= self.max_attempts {
                        return Err(GateError::retry_exhausted(
                            self.max_attempts,
                            failures.into_iter().collect(),
                        ));
                    }

                    // 1-indexed retry: the first retry sleeps backoff.delay(1)
                    let delay =
                        self.jitter.apply(self.backoff.delay(attempt + 1)).min(self.max_delay);

                    tracing::debug!(
                        attempt = attempt + 2,
                        delay_ms = delay.as_millis() as u64,
                        "retrying upstream call"
                    );
                    self.sleeper.sleep(delay).await;
                }
            }
        }

        // The loop always returns: every iteration either succeeds, short-circuits
        // on a non-retryable error, or exhausts on the last attempt.
        debug_assert!(false, "retry loop should have returned");
        unreachable!()
    }
}

/// Builder for `RetryPolicy`.
pub struct RetryPolicyBuilder<E> {
    max_attempts: usize,
    backoff: Backoff,
    max_delay: Duration,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
}

/// Errors produced while building a retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// `max_attempts` must be > 0.
    InvalidMaxAttempts(usize),
    /// `max_delay` must be > 0.
    InvalidMaxDelay,
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::InvalidMaxAttempts(n) => {
                write!(f, "max_attempts must be > 0 (got {})", n)
            }
            BuildError::InvalidMaxDelay => write!(f, "max_delay must be > 0"),
        }
    }
}

impl std::error::Error for BuildError {}

impl<E> RetryPolicyBuilder<E>
where
    E: std::error::Error + UpstreamStatus + Send + Sync + 'static,
{
    /// Create a builder with sane defaults: 3 attempts, 1s exponential base,
    /// 30s cap, uniform jitter, status-code retryability.
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_secs(1)),
            max_delay: Duration::from_secs(30),
            jitter: Jitter::uniform(),
            should_retry: Arc::new(|e: &E| is_transient(e)),
            sleeper: Arc::new(TokioSleeper),
        }
    }
}

impl<E> RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Set total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the backoff strategy.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Cap the per-retry delay after jitter is applied.
    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the jitter strategy.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Override the retryability predicate.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Build the retry policy, validating inputs.
    pub fn build(self) -> Result<RetryPolicy<E>, BuildError> {
        if self.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        if self.max_delay.is_zero() {
            return Err(BuildError::InvalidMaxDelay);
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            max_delay: self.max_delay,
            jitter: self.jitter,
            should_retry: self.should_retry,
            sleeper: self.sleeper,
        })
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: std::error::Error + UpstreamStatus + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
