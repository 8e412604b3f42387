//! Deserializable gateway configuration, validated once at startup.
//!
//! The configuration covers the admission surface only: tier limits, per-route
//! overrides, failover behavior, and the identity chain. It is deliberately
//! immutable after startup; anything dynamic (tier assignments, breaker state,
//! bucket balances) lives in the runtime types, not here. `validate()` rejects
//! nonsensical values up front so the admit path never has to.

use crate::rate_limit::{
    FailoverStrategy, HashAlgorithm, IdentityExtractor, IdentitySource, RouteOverride, Tier,
    TierLimits, TierTable,
};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Configuration rejected at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("tier '{tier}' has zero {field}")]
    ZeroTierValue { tier: Tier, field: &'static str },
    #[error("route override has an empty path prefix")]
    EmptyOverridePrefix,
    #[error("route override '{prefix}' has zero {field}")]
    ZeroOverrideValue { prefix: String, field: &'static str },
    #[error("duplicate route override prefix '{prefix}'")]
    DuplicateOverridePrefix { prefix: String },
    #[error("identity source chain is empty")]
    EmptyIdentityChain,
    #[error("failover local cache size must be > 0")]
    ZeroFallbackCapacity,
}

/// Behavior when the shared token store and the local mirror are both
/// unusable.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub strategy: FailoverStrategy,
    /// Maximum buckets held locally during a shared-store outage.
    pub local_cache_size: usize,
    /// Lifetime of a locally held bucket, in milliseconds.
    pub local_cache_ttl_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            strategy: FailoverStrategy::FailClosed,
            local_cache_size: 1_000,
            local_cache_ttl_ms: 300_000,
        }
    }
}

impl FailoverConfig {
    pub fn local_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.local_cache_ttl_ms)
    }
}

/// Credential sources and the hash that turns them into storage keys.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Sources checked in order; the first present credential wins.
    pub priority: Vec<IdentitySource>,
    pub hash_algorithm: HashAlgorithm,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            priority: vec![
                IdentitySource::ApiKeyHeader,
                IdentitySource::BearerToken,
                IdentitySource::QueryParam,
                IdentitySource::RemoteAddr,
            ],
            hash_algorithm: HashAlgorithm::Sip,
        }
    }
}

/// Full admission-control configuration.
///
/// Tiers missing from `tiers` use the built-in defaults, so an empty document
/// is a valid configuration.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub tiers: HashMap<Tier, TierLimits>,
    pub route_overrides: Vec<RouteOverride>,
    pub failover: FailoverConfig,
    pub identity: IdentityConfig,
}

impl GatewayConfig {
    /// Parse a JSON configuration document. Validation is separate so callers
    /// can distinguish "malformed" from "well-formed but nonsensical".
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Reject configurations that would misbehave at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (tier, limits) in &self.tiers {
            if limits.requests_per_minute == 0 {
                return Err(ConfigError::ZeroTierValue {
                    tier: *tier,
                    field: "requests_per_minute",
                });
            }
            if limits.burst_capacity == 0 {
                return Err(ConfigError::ZeroTierValue { tier: *tier, field: "burst_capacity" });
            }
            if limits.refill_rate <= 0.0 {
                return Err(ConfigError::ZeroTierValue { tier: *tier, field: "refill_rate" });
            }
            if limits.cost_per_request == 0 {
                return Err(ConfigError::ZeroTierValue {
                    tier: *tier,
                    field: "cost_per_request",
                });
            }
        }

        let mut seen = HashSet::new();
        for override_ in &self.route_overrides {
            if override_.prefix.is_empty() {
                return Err(ConfigError::EmptyOverridePrefix);
            }
            if override_.requests_per_minute == 0 {
                return Err(ConfigError::ZeroOverrideValue {
                    prefix: override_.prefix.clone(),
                    field: "requests_per_minute",
                });
            }
            if override_.cost_per_request == 0 {
                return Err(ConfigError::ZeroOverrideValue {
                    prefix: override_.prefix.clone(),
                    field: "cost_per_request",
                });
            }
            if !seen.insert(override_.prefix.as_str()) {
                return Err(ConfigError::DuplicateOverridePrefix {
                    prefix: override_.prefix.clone(),
                });
            }
        }

        if self.identity.priority.is_empty() {
            return Err(ConfigError::EmptyIdentityChain);
        }
        if self.failover.local_cache_size == 0 {
            return Err(ConfigError::ZeroFallbackCapacity);
        }

        Ok(())
    }

    /// The tier table this configuration describes.
    pub fn tier_table(&self) -> TierTable {
        TierTable::new(self.tiers.clone(), self.route_overrides.clone())
    }

    /// The identity extractor this configuration describes.
    pub fn identity_extractor(&self) -> IdentityExtractor {
        IdentityExtractor::new(self.identity.priority.clone(), self.identity.hash_algorithm)
    }
}
