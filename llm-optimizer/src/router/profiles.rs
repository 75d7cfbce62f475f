//! Provider cost profiles and provider selection.
//!
//! The registry is read-mostly: readers clone an `Arc` snapshot, writers
//! build a new table and swap it in whole.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

use crate::config::RoutingPolicy;
use crate::error::{Error, Result};
use crate::llm::CompletionRequest;

/// Smoothing factor for latency and success-rate moving averages.
const EMA_ALPHA: f64 = 0.1;

/// Per-provider cost, latency and reliability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCostProfile {
    pub provider: String,
    /// USD per token
    pub avg_cost_per_token: f64,
    /// Configured reliability (0.0 - 1.0)
    pub reliability: f64,
    pub avg_latency_ms: f64,
    /// Observed success rate (0.0 - 1.0)
    pub success_rate: f64,
    pub last_updated: DateTime<Utc>,
}

impl ProviderCostProfile {
    pub fn new(provider: impl Into<String>, avg_cost_per_token: f64) -> Self {
        Self {
            provider: provider.into(),
            avg_cost_per_token,
            reliability: 1.0,
            avg_latency_ms: 0.0,
            success_rate: 1.0,
            last_updated: Utc::now(),
        }
    }

    pub fn with_reliability(mut self, reliability: f64) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: f64) -> Self {
        self.avg_latency_ms = latency_ms;
        self
    }

    pub fn with_success_rate(mut self, success_rate: f64) -> Self {
        self.success_rate = success_rate;
        self
    }

    /// The weaker of configured reliability and observed success rate.
    pub fn effective_reliability(&self) -> f64 {
        self.reliability.min(self.success_rate)
    }

    pub fn estimate_cost(&self, tokens: u64) -> f64 {
        tokens as f64 * self.avg_cost_per_token
    }

    fn meets(&self, policy: &RoutingPolicy) -> bool {
        self.effective_reliability() >= policy.min_reliability
            && policy
                .max_latency_ms
                .map_or(true, |max| self.avg_latency_ms <= max as f64)
    }

    fn validate(&self) -> Result<()> {
        if self.provider.is_empty() {
            return Err(Error::validation("provider", "must not be empty"));
        }
        if !self.avg_cost_per_token.is_finite() || self.avg_cost_per_token < 0.0 {
            return Err(Error::validation(
                "avgCostPerToken",
                format!("{} is not a valid cost", self.avg_cost_per_token),
            ));
        }
        Ok(())
    }
}

/// Cheapest first, then fastest, then by name.
fn cheapest(a: &ProviderCostProfile, b: &ProviderCostProfile) -> Ordering {
    a.avg_cost_per_token
        .total_cmp(&b.avg_cost_per_token)
        .then(a.avg_latency_ms.total_cmp(&b.avg_latency_ms))
        .then_with(|| a.provider.cmp(&b.provider))
}

/// Optional scoring hint consulted before the cost rule.
///
/// Returning `None` for a provider leaves it unscored; if nothing is scored,
/// selection falls back to the cheapest eligible provider.
pub trait ProviderScorer: Send + Sync {
    fn score(&self, request: &CompletionRequest, profile: &ProviderCostProfile) -> Option<f64>;
}

/// Provider selection output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub provider: String,
    pub cost_per_token: f64,
    /// Reasoning for selection
    pub reason: String,
    /// Chosen by the scorer rather than the cost rule
    pub scored: bool,
}

impl RoutingDecision {
    fn from_profile(profile: &ProviderCostProfile, reason: String, scored: bool) -> Self {
        Self {
            provider: profile.provider.clone(),
            cost_per_token: profile.avg_cost_per_token,
            reason,
            scored,
        }
    }
}

/// Read-mostly table of provider profiles.
#[derive(Debug, Default)]
pub struct ProviderProfileRegistry {
    profiles: RwLock<Arc<Vec<ProviderCostProfile>>>,
}

impl ProviderProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profiles(profiles: Vec<ProviderCostProfile>) -> Result<Self> {
        let registry = Self::new();
        registry.replace_all(profiles)?;
        Ok(registry)
    }

    /// Current snapshot.
    pub fn all(&self) -> Arc<Vec<ProviderCostProfile>> {
        Arc::clone(&self.profiles.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn get(&self, provider: &str) -> Option<ProviderCostProfile> {
        self.all().iter().find(|p| p.provider == provider).cloned()
    }

    pub fn len(&self) -> usize {
        self.all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.all().is_empty()
    }

    /// Add or replace one provider's profile.
    pub fn register(&self, profile: ProviderCostProfile) -> Result<()> {
        profile.validate()?;
        self.update(|profiles| {
            match profiles.iter_mut().find(|p| p.provider == profile.provider) {
                Some(existing) => *existing = profile,
                None => profiles.push(profile),
            }
        });
        Ok(())
    }

    /// Swap in a whole new table. Rejected tables leave the old one in place.
    pub fn replace_all(&self, profiles: Vec<ProviderCostProfile>) -> Result<()> {
        for (i, profile) in profiles.iter().enumerate() {
            profile.validate()?;
            if profiles[..i].iter().any(|p| p.provider == profile.provider) {
                return Err(Error::validation(
                    "provider",
                    format!("'{}' is listed more than once", profile.provider),
                ));
            }
        }
        *self.profiles.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(profiles);
        Ok(())
    }

    /// Fold one observed call into the provider's latency and success rate.
    pub fn record_outcome(&self, provider: &str, latency_ms: u64, success: bool) {
        let mut found = false;
        self.update(|profiles| {
            if let Some(profile) = profiles.iter_mut().find(|p| p.provider == provider) {
                let outcome = if success { 1.0 } else { 0.0 };
                profile.success_rate += EMA_ALPHA * (outcome - profile.success_rate);
                if success {
                    profile.avg_latency_ms +=
                        EMA_ALPHA * (latency_ms as f64 - profile.avg_latency_ms);
                }
                profile.last_updated = Utc::now();
                found = true;
            }
        });
        if !found {
            debug!(provider, "Outcome for unregistered provider ignored");
        }
    }

    /// Estimated cost of `tokens` on `provider`, if registered.
    pub fn estimate_cost(&self, provider: &str, tokens: u64) -> Option<f64> {
        self.get(provider).map(|p| p.estimate_cost(tokens))
    }

    fn update(&self, f: impl FnOnce(&mut Vec<ProviderCostProfile>)) {
        let mut guard = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.as_ref().clone();
        f(&mut next);
        *guard = Arc::new(next);
    }

    /// Pick a provider for `request`.
    ///
    /// With a scorer, the highest-scoring eligible provider wins. Otherwise
    /// the cheapest eligible provider per token wins, ties going to lower
    /// latency. When no provider meets the policy, the cheapest overall is
    /// used.
    pub fn select(
        &self,
        request: &CompletionRequest,
        policy: &RoutingPolicy,
        scorer: Option<&dyn ProviderScorer>,
    ) -> Result<RoutingDecision> {
        let profiles = self.all();
        if profiles.is_empty() {
            return Err(Error::validation("providers", "no provider profiles registered"));
        }

        let eligible: Vec<&ProviderCostProfile> =
            profiles.iter().filter(|p| p.meets(policy)).collect();

        if let Some(scorer) = scorer {
            let best = eligible
                .iter()
                .filter_map(|p| scorer.score(request, p).map(|s| (*p, s)))
                .filter(|(_, s)| s.is_finite())
                .max_by(|(a, sa), (b, sb)| sa.total_cmp(sb).then_with(|| cheapest(b, a)));
            if let Some((profile, score)) = best {
                return Ok(RoutingDecision::from_profile(
                    profile,
                    format!("highest score {:.3}", score),
                    true,
                ));
            }
        }

        if let Some(profile) = eligible.iter().copied().min_by(|a, b| cheapest(a, b)) {
            return Ok(RoutingDecision::from_profile(
                profile,
                format!(
                    "lowest cost per token among {} eligible providers",
                    eligible.len()
                ),
                false,
            ));
        }

        // Non-empty table, so a minimum always exists.
        let fallback = profiles
            .iter()
            .min_by(|a, b| cheapest(a, b))
            .ok_or_else(|| Error::Internal("empty provider snapshot".to_string()))?;
        warn!(
            provider = %fallback.provider,
            min_reliability = policy.min_reliability,
            "No provider meets routing policy; using cheapest"
        );
        Ok(RoutingDecision::from_profile(
            fallback,
            "no provider meets routing policy; cheapest overall".to_string(),
            false,
        ))
    }
}
