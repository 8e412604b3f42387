//! Additive jitter to prevent synchronized retry storms.
//!
//! Every concurrent caller backing off from the same upstream incident would
//! otherwise retry on the same schedule. `Uniform` jitter adds a uniform random
//! duration (default cap 1 second) on top of the computed backoff delay.
//!
//! Notes:
//! - RNG: uses `rand`'s thread-local RNG by default; deterministic RNGs can be
//!   injected via `apply_with_rng`.
//! - Precision: millisecond conversions saturate to `u64::MAX` to avoid panics
//!   on very large durations.

use rand::{rng, Rng};
use std::time::Duration;

/// Default jitter cap: up to one second of added randomness.
pub const DEFAULT_JITTER_CAP: Duration = Duration::from_secs(1);

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Jitter {
    /// No jitter - use the exact backoff delay (deterministic tests).
    None,
    /// Add a uniform random duration in `[0, cap]` to the delay.
    Uniform(Duration),
}

impl Jitter {
    /// Uniform jitter with the default 1-second cap.
    pub fn uniform() -> Self {
        Jitter::Uniform(DEFAULT_JITTER_CAP)
    }

    /// Uniform jitter with an explicit cap.
    pub fn uniform_up_to(cap: Duration) -> Self {
        Jitter::Uniform(cap)
    }

    /// Apply jitter to a delay duration.
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a custom RNG (for testing).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Uniform(cap) => {
                let cap_millis = Self::as_millis_saturated(*cap);
                if cap_millis == 0 {
                    return delay;
                }
                let added = rng.random_range(0..=cap_millis);
                delay.saturating_add(Duration::from_millis(added))
            }
        }
    }

    fn as_millis_saturated(duration: Duration) -> u64 {
        duration.as_millis().try_into().unwrap_or(u64::MAX)
    }
}
