//! Circuit breaker guarding the upstream session API.
//!
//! Deliberately simpler than a three-state breaker: there is no half-open
//! probe isolation. Once `reset_timeout` has elapsed since the last recorded
//! failure, `is_open()` reports closed and the next call is a live trial. The
//! failure counter is only reset by `record_success`, so a failed trial stamps
//! a fresh timestamp and the breaker is open again immediately. That single
//! post-timeout trial is the recovery probe; there is no dedicated probe
//! state to re-trip from.
//!
//! Callers must check `is_open()` before attempting a call and must invoke
//! exactly one of `record_success`/`record_failure` once the outcome is known.
//! [`crate::UpstreamGate`] wires this discipline up for the retry orchestrator.

use crate::clock::{Clock, MonotonicClock};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    threshold: usize,
    reset_timeout: Duration,
}

impl CircuitBreakerConfig {
    /// Create a config with validation.
    pub fn new(threshold: usize, reset_timeout: Duration) -> Result<Self, CircuitBreakerError> {
        let cfg = Self { threshold, reset_timeout };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Consecutive failures before the breaker opens.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// How long the breaker stays open after the last recorded failure.
    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }

    fn validate(&self) -> Result<(), CircuitBreakerError> {
        if self.threshold == 0 {
            return Err(CircuitBreakerError::InvalidThreshold { provided: 0 });
        }
        if self.reset_timeout.is_zero() {
            return Err(CircuitBreakerError::InvalidResetTimeout(self.reset_timeout));
        }
        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    /// Defaults: 5 consecutive failures, 60 second reset timeout.
    fn default() -> Self {
        Self { threshold: 5, reset_timeout: Duration::from_secs(60) }
    }
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerError {
    /// Threshold must be > 0.
    InvalidThreshold {
        /// Value provided by caller.
        provided: usize,
    },
    /// Reset timeout must be > 0.
    InvalidResetTimeout(Duration),
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::InvalidThreshold { provided } => {
                write!(f, "threshold must be > 0 (got {})", provided)
            }
            CircuitBreakerError::InvalidResetTimeout(timeout) => {
                write!(f, "reset_timeout must be > 0 (got {:?})", timeout)
            }
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

#[derive(Debug)]
struct BreakerState {
    failure_count: AtomicUsize,
    last_failure_at: AtomicU64,
}

/// Binary health gate over the upstream dependency.
///
/// Clones share the same underlying state via `Arc`, so every handle observes
/// and affects the same failure count. One instance per protected dependency;
/// state is owned here, never ambient.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: Arc<BreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a breaker, validating threshold and timeout.
    ///
    /// # Examples
    /// ```
    /// use gatehouse::CircuitBreaker;
    /// use std::time::Duration;
    /// let breaker = CircuitBreaker::new(5, Duration::from_secs(60)).unwrap();
    /// assert!(!breaker.is_open());
    /// ```
    pub fn new(threshold: usize, reset_timeout: Duration) -> Result<Self, CircuitBreakerError> {
        Ok(Self::from_config(CircuitBreakerConfig::new(threshold, reset_timeout)?))
    }

    /// Create a breaker from an explicit, already-validated config.
    pub fn with_config(config: CircuitBreakerConfig) -> Result<Self, CircuitBreakerError> {
        config.validate()?;
        Ok(Self::from_config(config))
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    fn from_config(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(BreakerState {
                failure_count: AtomicUsize::new(0),
                last_failure_at: AtomicU64::new(0),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Whether calls should be rejected right now.
    ///
    /// True iff the consecutive-failure count has reached the threshold and
    /// `reset_timeout` has not yet elapsed since the last failure. Observing
    /// an elapsed timeout does not reset the counter; the next call is a
    /// single live trial.
    pub fn is_open(&self) -> bool {
        let failures = self.state.failure_count.load(Ordering::Acquire);
        if failures < self.config.threshold {
            return false;
        }
        let last = self.state.last_failure_at.load(Ordering::Acquire);
        let elapsed = self.clock.now_millis().saturating_sub(last);
        elapsed < self.config.reset_timeout.as_millis() as u64
    }

    /// Record a successful call, resetting the consecutive-failure count.
    pub fn record_success(&self) {
        let previous = self.state.failure_count.swap(0, Ordering::AcqRel);
        if previous >= self.config.threshold {
            tracing::info!(failures = previous, "circuit breaker closed after successful trial");
        }
    }

    /// Record a failed call, incrementing the count and stamping the time.
    pub fn record_failure(&self) {
        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.last_failure_at.store(self.clock.now_millis(), Ordering::Release);
        if failures == self.config.threshold {
            tracing::error!(
                failures,
                threshold = self.config.threshold,
                "circuit breaker opened"
            );
        } else {
            tracing::debug!(failures, "upstream failure recorded");
        }
    }

    /// Current consecutive-failure count, for metrics.
    pub fn failure_count(&self) -> usize {
        self.state.failure_count.load(Ordering::Acquire)
    }

    /// How long the breaker has been open (zero when closed).
    pub fn open_for(&self) -> Duration {
        if !self.is_open() {
            return Duration::ZERO;
        }
        let last = self.state.last_failure_at.load(Ordering::Acquire);
        Duration::from_millis(self.clock.now_millis().saturating_sub(last))
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::from_config(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<AtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(AtomicU64::new(0)) }
        }

        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn rejects_zero_threshold() {
        let err = CircuitBreaker::new(0, Duration::from_secs(1))
            .expect_err("zero threshold should be invalid");
        assert!(matches!(err, CircuitBreakerError::InvalidThreshold { provided: 0 }));
    }

    #[test]
    fn rejects_zero_timeout() {
        let err = CircuitBreaker::new(1, Duration::ZERO)
            .expect_err("zero timeout should be invalid");
        assert!(matches!(err, CircuitBreakerError::InvalidResetTimeout(t) if t.is_zero()));
    }

    #[test]
    fn starts_closed() {
        let breaker = CircuitBreaker::default();
        assert!(!breaker.is_open());
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(60)).unwrap();

        for _ in 0..4 {
            breaker.record_failure();
            assert!(!breaker.is_open());
        }
        breaker.record_failure();
        assert!(breaker.is_open());
        assert_eq!(breaker.failure_count(), 5);
    }

    #[test]
    fn success_resets_consecutive_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60)).unwrap();

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);

        // F-F-S-F-F never opens with threshold 3
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
    }

    #[test]
    fn auto_closes_after_reset_timeout() {
        let clock = ManualClock::new();
        let breaker =
            CircuitBreaker::new(5, Duration::from_secs(60)).unwrap().with_clock(clock.clone());

        for _ in 0..5 {
            breaker.record_failure();
        }
        assert!(breaker.is_open());

        clock.advance(59_999);
        assert!(breaker.is_open(), "still inside the timeout");

        clock.advance(1);
        assert!(!breaker.is_open(), "timeout elapsed, next call is a live trial");

        // A single success fully resets the counter
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
        assert!(!breaker.is_open());
    }

    #[test]
    fn failed_trial_reopens_immediately() {
        let clock = ManualClock::new();
        let breaker =
            CircuitBreaker::new(2, Duration::from_millis(100)).unwrap().with_clock(clock.clone());

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_open());

        clock.advance(150);
        assert!(!breaker.is_open());

        // The trial failed: count was never reset, so one failure re-trips it
        breaker.record_failure();
        assert!(breaker.is_open());
    }

    #[test]
    fn open_for_tracks_elapsed_time() {
        let clock = ManualClock::new();
        let breaker =
            CircuitBreaker::new(1, Duration::from_secs(60)).unwrap().with_clock(clock.clone());

        assert_eq!(breaker.open_for(), Duration::ZERO);
        breaker.record_failure();
        clock.advance(5_000);
        assert_eq!(breaker.open_for(), Duration::from_millis(5_000));
    }

    #[test]
    fn clones_share_state() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60)).unwrap();
        let other = breaker.clone();

        breaker.record_failure();
        other.record_failure();
        assert!(breaker.is_open());
        assert!(other.is_open());
    }
}
