//! Tiered token-bucket admission with local failover.
//!
//! Each caller identity gets one bucket per route, keyed `"<identity>:<route>"`
//! in a shared [`TokenStore`] so that every instance fronting the same upstream
//! enforces one combined limit. Buckets refill lazily: the stored state is
//! `(tokens, last_updated)` and the current balance is derived at read time
//! from the elapsed interval, so idle buckets cost nothing.
//!
//! Writes go through compare-and-set. A racing writer re-reads and retries up
//! to three times; persistent contention is treated as a denial with a short
//! retry hint rather than a spin, except for bypass tiers, which are admitted
//! without recording their consumption.
//!
//! When the shared store is unreachable the limiter degrades to a local,
//! size- and TTL-bounded mirror ([`FallbackBuckets`]) and keeps enforcing
//! per-instance limits. The configured [`FailoverStrategy`] only matters when
//! even the mirror cannot hold the bucket. Once the shared store answers
//! again the mirror is discarded; it is never merged back.

use crate::clock::{Clock, MonotonicClock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub mod identity;
pub mod store;
pub mod tiers;

pub use identity::{HashAlgorithm, Identity, IdentityExtractor, IdentitySource};
pub use store::{FallbackBuckets, InMemoryTokenStore, TokenStore};
pub use tiers::{ResolvedLimits, RouteOverride, Tier, TierLimits, TierTable};

/// What to do when neither the shared store nor the local mirror can serve a
/// bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverStrategy {
    /// Admit the request unchecked.
    FailOpen,
    /// Deny the request.
    FailClosed,
}

/// Which storage served the most recent decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterMode {
    Shared,
    Fallback,
}

/// The outcome of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The request may proceed.
    Allowed {
        /// Whole tokens left in the bucket, for `X-RateLimit-Remaining`.
        remaining: u32,
        /// Time until the bucket is full again.
        reset_after: Duration,
        /// True when the caller's tier bypasses enforcement.
        bypassed: bool,
    },
    /// The request must wait.
    Denied {
        /// How long until enough tokens accumulate, for `Retry-After`.
        retry_after: Duration,
        /// The requests-per-minute limit in force, for `X-RateLimit-Limit`.
        limit: u32,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Operational snapshot for the metrics surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RateLimiterMetrics {
    pub shared_store_connected: bool,
    pub mode: LimiterMode,
    pub fallback_cache_size: usize,
    /// Requests admitted since startup, bypass admissions included.
    pub requests_admitted: u64,
    /// Requests denied since startup.
    pub requests_denied: u64,
    pub tier_limits: HashMap<Tier, TierLimits>,
}

/// Token-bucket limiter with tier-aware limits and store failover.
pub struct TieredRateLimiter<S> {
    store: Arc<S>,
    tiers: TierTable,
    assignments: Mutex<HashMap<Identity, Tier>>,
    fallback: FallbackBuckets,
    strategy: FailoverStrategy,
    shared_connected: AtomicBool,
    admitted: AtomicU64,
    denied: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl<S> TieredRateLimiter<S>
where
    S: TokenStore,
{
    /// Build a limiter over `store` with the given tier table.
    ///
    /// `fallback_size` and `fallback_ttl` bound the local mirror used while
    /// the shared store is unreachable.
    pub fn new(
        store: S,
        tiers: TierTable,
        strategy: FailoverStrategy,
        fallback_size: usize,
        fallback_ttl: Duration,
    ) -> Self {
        Self {
            store: Arc::new(store),
            tiers,
            assignments: Mutex::new(HashMap::new()),
            fallback: FallbackBuckets::new(fallback_size, fallback_ttl),
            strategy,
            shared_connected: AtomicBool::new(true),
            admitted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (useful for deterministic refill tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Assign a tier to an identity. Unassigned identities are `Free`.
    pub fn set_tier(&self, identity: Identity, tier: Tier) {
        self.assignments.lock().unwrap().insert(identity, tier);
    }

    /// The tier currently assigned to an identity.
    pub fn tier_of(&self, identity: &Identity) -> Tier {
        self.assignments
            .lock()
            .unwrap()
            .get(identity)
            .copied()
            .unwrap_or(Tier::Free)
    }

    /// Check whether one request for `route` by `identity` may proceed, and
    /// consume its cost if so.
    ///
    /// Never returns an error: storage failures switch the limiter to its
    /// local mirror and, as a last resort, the failover strategy decides.
    pub async fn admit(&self, identity: &Identity, route: &str) -> Decision {
        let tier = self.tier_of(identity);
        let limits = self.tiers.resolve(tier, route);
        let key = format!("{}:{}", identity, route);
        let now = self.clock.now_millis();

        let decision = match self.admit_shared(&key, &limits, now).await {
            Ok(decision) => {
                if !self.shared_connected.swap(true, Ordering::SeqCst) {
                    tracing::info!("shared token store reachable again, dropping local buckets");
                    self.fallback.clear();
                }
                decision
            }
            Err(error) => {
                if self.shared_connected.swap(false, Ordering::SeqCst) {
                    tracing::warn!(%error, "shared token store unreachable, switching to local buckets");
                }
                self.admit_fallback(&key, &limits, now)
            }
        };

        match &decision {
            Decision::Allowed { .. } => self.admitted.fetch_add(1, Ordering::Relaxed),
            Decision::Denied { .. } => self.denied.fetch_add(1, Ordering::Relaxed),
        };
        decision
    }

    async fn admit_shared(
        &self,
        key: &str,
        limits: &ResolvedLimits,
        now: u64,
    ) -> Result<Decision, S::Error> {
        // Optimistic locking: re-read and retry on a racing writer.
        for _ in 0..3 {
            let (tokens, last_updated) = match self.store.get_state(key).await? {
                Some(state) => state,
                None => (limits.burst_capacity, now),
            };
            let balance = refill(tokens, last_updated, now, limits);

            match spend(balance, limits) {
                Spend::Charged(remaining) => {
                    if self
                        .store
                        .set_state(key, remaining, now, Some(last_updated))
                        .await?
                    {
                        return Ok(allowed(remaining, limits));
                    }
                    // Raced; loop and re-read.
                }
                Spend::Short(missing) => {
                    return Ok(denied(missing, limits));
                }
            }
        }

        if limits.bypass {
            // Consumption recording is best-effort for bypass tiers; losing
            // the race never costs them admission.
            tracing::debug!(key, "token store contention, bypass tier admitted unrecorded");
            return Ok(Decision::Allowed {
                remaining: 0,
                reset_after: Duration::ZERO,
                bypassed: true,
            });
        }

        tracing::debug!(key, "token store contention, denying with short retry hint");
        Ok(Decision::Denied {
            retry_after: Duration::from_millis(100),
            limit: limits.requests_per_minute,
        })
    }

    fn admit_fallback(&self, key: &str, limits: &ResolvedLimits, now: u64) -> Decision {
        let (tokens, last_updated) = match self.fallback.get(key, now) {
            Some(state) => state,
            None => (limits.burst_capacity, now),
        };
        let balance = refill(tokens, last_updated, now, limits);

        let (decision, remaining) = match spend(balance, limits) {
            Spend::Charged(remaining) => (allowed(remaining, limits), remaining),
            Spend::Short(missing) => return denied(missing, limits),
        };

        if self.fallback.put(key, remaining, now, now) {
            decision
        } else if limits.bypass {
            tracing::warn!(key, "local bucket mirror full, bypass tier admitted unrecorded");
            Decision::Allowed {
                remaining: 0,
                reset_after: Duration::ZERO,
                bypassed: true,
            }
        } else {
            match self.strategy {
                FailoverStrategy::FailOpen => {
                    tracing::warn!(key, "local bucket mirror full, admitting unchecked");
                    Decision::Allowed {
                        remaining: 0,
                        reset_after: Duration::ZERO,
                        bypassed: false,
                    }
                }
                FailoverStrategy::FailClosed => {
                    tracing::warn!(key, "local bucket mirror full, denying");
                    denied(limits.cost, limits)
                }
            }
        }
    }

    /// Current operating mode, usage totals, and tier configuration.
    pub fn metrics(&self) -> RateLimiterMetrics {
        let connected = self.shared_connected.load(Ordering::SeqCst);
        RateLimiterMetrics {
            shared_store_connected: connected,
            mode: if connected {
                LimiterMode::Shared
            } else {
                LimiterMode::Fallback
            },
            fallback_cache_size: self.fallback.len(),
            requests_admitted: self.admitted.load(Ordering::Relaxed),
            requests_denied: self.denied.load(Ordering::Relaxed),
            tier_limits: self.tiers.all_limits(),
        }
    }
}

/// Balance after crediting the interval since the last update, capped at burst.
fn refill(tokens: f64, last_updated: u64, now: u64, limits: &ResolvedLimits) -> f64 {
    let elapsed_secs = now.saturating_sub(last_updated) as f64 / 1_000.0;
    (tokens + elapsed_secs * limits.refill_rate).min(limits.burst_capacity)
}

enum Spend {
    /// Cost deducted; holds the new balance.
    Charged(f64),
    /// Not enough tokens; holds the shortfall.
    Short(f64),
}

fn spend(balance: f64, limits: &ResolvedLimits) -> Spend {
    if limits.bypass {
        // Bypass tiers always pass, but their consumption still drains the
        // bucket (floored at zero) so the metrics reflect real usage.
        Spend::Charged((balance - limits.cost).max(0.0))
    } else if balance >= limits.cost {
        Spend::Charged(balance - limits.cost)
    } else {
        Spend::Short(limits.cost - balance)
    }
}

fn allowed(remaining: f64, limits: &ResolvedLimits) -> Decision {
    let deficit = limits.burst_capacity - remaining;
    Decision::Allowed {
        remaining: remaining as u32,
        reset_after: Duration::from_secs_f64(deficit / limits.refill_rate),
        bypassed: limits.bypass,
    }
}

fn denied(missing: f64, limits: &ResolvedLimits) -> Decision {
    Decision::Denied {
        retry_after: Duration::from_secs_f64(missing / limits.refill_rate),
        limit: limits.requests_per_minute,
    }
}
