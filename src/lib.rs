#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Gatehouse
//!
//! Admission control and resilience for services fronting an upstream
//! session API: decide which requests proceed, smooth bursts, shield the
//! upstream from overload, retry transient failures, and cache results.
//!
//! ## Features
//!
//! - **Tiered rate limiting**: shared token buckets per caller and route,
//!   with per-route overrides and a bounded local fallback when the shared
//!   store is unreachable
//! - **Circuit breaking** with timed auto-close (no half-open state)
//! - **Bounded retry** with exponential backoff, jitter, and
//!   status-code-aware retryability
//! - **Result caching**: LRU eviction, per-entry TTL, substring invalidation
//! - **Priority session queueing** with bounded terminal retention
//! - **Tower middleware** tying admission into a service stack
//!
//! ## Quick Start
//!
//! ```rust
//! use gatehouse::{
//!     FailoverStrategy, InMemoryTokenStore, TieredRateLimiter, TierTable,
//!     IdentityExtractor,
//! };
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = TieredRateLimiter::new(
//!         InMemoryTokenStore::new(),
//!         TierTable::default(),
//!         FailoverStrategy::FailClosed,
//!         1_000,
//!         Duration::from_secs(300),
//!     );
//!
//!     let extractor = IdentityExtractor::default();
//!     let identity = extractor
//!         .extract(|_| Some("sk-example".to_string()))
//!         .expect("credential present");
//!
//!     let decision = limiter.admit(&identity, "/api/sessions").await;
//!     assert!(decision.is_allowed());
//! }
//! ```

pub mod admission;
pub mod backoff;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod jitter;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod sleeper;

// Re-exports
pub use admission::{AdmissionLayer, AdmissionRequest, AdmissionService, UpstreamGate};
pub use backoff::Backoff;
pub use cache::{BoundedCache, CacheError, CacheStats};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
pub use clock::{Clock, MonotonicClock};
pub use config::{ConfigError, FailoverConfig, GatewayConfig, IdentityConfig};
pub use error::{GateError, UpstreamStatus};
pub use jitter::Jitter;
pub use queue::{QueueError, QueueItem, QueueStats, QueueStatus, SessionQueue};
pub use rate_limit::{
    Decision, FailoverStrategy, HashAlgorithm, Identity, IdentityExtractor, IdentitySource,
    InMemoryTokenStore, LimiterMode, RateLimiterMetrics, Tier, TierLimits, TierTable,
    TieredRateLimiter, TokenStore,
};
pub use retry::{RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
