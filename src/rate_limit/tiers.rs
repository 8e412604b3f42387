//! Caller tiers and per-route limit overrides.
//!
//! The tier table is immutable per deployment: it is validated once at startup
//! (see [`crate::config`]) and then only read on the admit path. Route
//! overrides replace the tier's requests-per-minute and cost for the longest
//! matching path prefix; unmatched routes use the tier defaults.

use std::collections::HashMap;

/// Caller class. Unknown identities are treated as `Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limits attached to a tier.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TierLimits {
    pub requests_per_minute: u32,
    /// Maximum token balance a bucket can hold.
    pub burst_capacity: u32,
    /// Tokens added per second.
    pub refill_rate: f64,
    pub window_ms: u64,
    pub cost_per_request: u32,
    /// Bypass tiers always admit; consumption is still recorded for metrics.
    #[serde(default)]
    pub bypass_rate_limiting: bool,
}

impl TierLimits {
    pub fn free() -> Self {
        Self {
            requests_per_minute: 60,
            burst_capacity: 10,
            refill_rate: 1.0,
            window_ms: 60_000,
            cost_per_request: 1,
            bypass_rate_limiting: false,
        }
    }

    pub fn pro() -> Self {
        Self {
            requests_per_minute: 300,
            burst_capacity: 50,
            refill_rate: 5.0,
            window_ms: 60_000,
            cost_per_request: 1,
            bypass_rate_limiting: false,
        }
    }

    pub fn enterprise() -> Self {
        Self {
            requests_per_minute: 1_500,
            burst_capacity: 150,
            refill_rate: 25.0,
            window_ms: 60_000,
            cost_per_request: 1,
            bypass_rate_limiting: false,
        }
    }
}

/// Per-route limit override, matched by path prefix.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RouteOverride {
    /// Path prefix, e.g. `/api/sessions`.
    pub prefix: String,
    pub requests_per_minute: u32,
    pub cost_per_request: u32,
}

/// Limits resolved for one (tier, route) pair on the admit path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedLimits {
    pub requests_per_minute: u32,
    pub burst_capacity: f64,
    pub refill_rate: f64,
    pub cost: f64,
    pub bypass: bool,
}

/// Validated tier table plus route overrides.
#[derive(Debug, Clone)]
pub struct TierTable {
    limits: HashMap<Tier, TierLimits>,
    overrides: Vec<RouteOverride>,
}

impl TierTable {
    pub fn new(limits: HashMap<Tier, TierLimits>, overrides: Vec<RouteOverride>) -> Self {
        Self { limits, overrides }
    }

    /// Limits for a tier. Tiers missing from the table use the built-in defaults.
    pub fn limits(&self, tier: Tier) -> TierLimits {
        self.limits.get(&tier).cloned().unwrap_or_else(|| match tier {
            Tier::Free => TierLimits::free(),
            Tier::Pro => TierLimits::pro(),
            Tier::Enterprise => TierLimits::enterprise(),
        })
    }

    /// Snapshot of the full table, for the metrics surface.
    pub fn all_limits(&self) -> HashMap<Tier, TierLimits> {
        let mut out = HashMap::new();
        for tier in [Tier::Free, Tier::Pro, Tier::Enterprise] {
            out.insert(tier, self.limits(tier));
        }
        out
    }

    /// Resolve the limits in force for a (tier, route) pair.
    ///
    /// An override replaces requests-per-minute (and thus the refill rate,
    /// derived as rpm/60 tokens per second) and the cost; burst capacity and
    /// the bypass flag always come from the tier.
    pub fn resolve(&self, tier: Tier, route: &str) -> ResolvedLimits {
        let limits = self.limits(tier);
        let matched = self
            .overrides
            .iter()
            .filter(|o| route.starts_with(o.prefix.as_str()))
            .max_by_key(|o| o.prefix.len());

        match matched {
            Some(o) => ResolvedLimits {
                requests_per_minute: o.requests_per_minute,
                burst_capacity: f64::from(limits.burst_capacity),
                refill_rate: f64::from(o.requests_per_minute) / 60.0,
                cost: f64::from(o.cost_per_request),
                bypass: limits.bypass_rate_limiting,
            },
            None => ResolvedLimits {
                requests_per_minute: limits.requests_per_minute,
                burst_capacity: f64::from(limits.burst_capacity),
                refill_rate: limits.refill_rate,
                cost: f64::from(limits.cost_per_request),
                bypass: limits.bypass_rate_limiting,
            },
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        let mut limits = HashMap::new();
        limits.insert(Tier::Free, TierLimits::free());
        limits.insert(Tier::Pro, TierLimits::pro());
        limits.insert(Tier::Enterprise, TierLimits::enterprise());
        Self { limits, overrides: Vec::new() }
    }
}
