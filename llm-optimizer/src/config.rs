//! Optimizer configuration.
//!
//! Every recognized option is enumerated here with its default. Unknown
//! options are rejected at parse time and values are checked by
//! [`OptimizerConfig::validate`] before any component is built.

use serde::{Deserialize, Serialize};

use crate::cache::ttl_span;
use crate::error::{Error, Result};

/// Weights for the cost-aware eviction score.
///
/// `score = cost*cost_w + hits*frequency_w - idle_secs*recency_w - age_ms/10000`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvictionWeights {
    pub cost: f64,
    pub frequency: f64,
    pub recency: f64,
}

impl Default for EvictionWeights {
    fn default() -> Self {
        Self {
            cost: 1000.0,
            frequency: 1.0,
            recency: 0.1,
        }
    }
}

/// Minimum requirements a provider must meet to be routed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct RoutingPolicy {
    /// Minimum reliability (0.0 - 1.0)
    pub min_reliability: f64,
    /// Maximum acceptable average latency, if any
    pub max_latency_ms: Option<u64>,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            min_reliability: 0.9,
            max_latency_ms: None,
        }
    }
}

/// How a combined batch's usage and cost are attributed to its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostSplit {
    /// Divide evenly regardless of member size.
    #[default]
    Even,
    /// Divide in proportion to each member's estimated tokens.
    Proportional,
}

/// Configuration for the optimization pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct OptimizerConfig {
    /// Hot tier capacity (entries)
    pub l1_size: usize,
    /// Warm tier capacity (entries)
    pub l2_size: usize,
    /// Cold tier capacity (entries)
    pub l3_size: usize,
    /// Default time-to-live in milliseconds
    #[serde(rename = "defaultTTL")]
    pub default_ttl_ms: u64,
    /// Static maximum batch size
    pub max_batch_size: usize,
    /// Initial batch window in milliseconds
    pub batch_window_ms: u64,
    /// Oldest queued request forces a flush after this long
    pub max_wait_time_ms: u64,
    /// Maximum simultaneous upstream executions from the aggregator
    pub concurrency: usize,
    /// Target fraction of spend to save (0.0 - 1.0)
    pub target_cost_reduction: f64,
    pub enable_dynamic_batching: bool,
    pub enable_priority_queuing: bool,
    pub enable_smart_grouping: bool,
    pub enable_predictive_warming: bool,
    pub caching_enabled: bool,
    pub intelligent_routing_enabled: bool,

    pub eviction_weights: EvictionWeights,
    /// Fraction of an overflowing tier demoted per eviction pass
    pub eviction_fraction: f64,
    /// Hits per second above which rebalance promotes an entry
    pub promotion_threshold: f64,
    pub maintenance_interval_ms: u64,
    /// Upper bound on entries touched by one maintenance tick
    pub maintenance_batch_limit: usize,
    pub adaptive_interval_ms: u64,
    /// Requests at or above this priority flush their queue immediately
    pub high_priority_threshold: u8,
    pub min_batch_size: usize,
    pub min_window_ms: u64,
    pub routing: RoutingPolicy,
    pub cost_split: CostSplit,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            l1_size: 100,
            l2_size: 1000,
            l3_size: 10_000,
            default_ttl_ms: 3_600_000,
            max_batch_size: 10,
            batch_window_ms: 100,
            max_wait_time_ms: 1000,
            concurrency: 5,
            target_cost_reduction: 0.3,
            enable_dynamic_batching: true,
            enable_priority_queuing: true,
            enable_smart_grouping: true,
            enable_predictive_warming: false,
            caching_enabled: true,
            intelligent_routing_enabled: true,
            eviction_weights: EvictionWeights::default(),
            eviction_fraction: 0.1,
            promotion_threshold: 0.1,
            maintenance_interval_ms: 60_000,
            maintenance_batch_limit: 256,
            adaptive_interval_ms: 5_000,
            high_priority_threshold: 8,
            min_batch_size: 2,
            min_window_ms: 10,
            routing: RoutingPolicy::default(),
            cost_split: CostSplit::Even,
        }
    }
}

impl OptimizerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from JSON and validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::validation("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_tier_sizes(mut self, l1: usize, l2: usize, l3: usize) -> Self {
        self.l1_size = l1;
        self.l2_size = l2;
        self.l3_size = l3;
        self
    }

    pub fn with_default_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.default_ttl_ms = ttl_ms;
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_batch_window_ms(mut self, window_ms: u64) -> Self {
        self.batch_window_ms = window_ms;
        self
    }

    pub fn with_max_wait_time_ms(mut self, wait_ms: u64) -> Self {
        self.max_wait_time_ms = wait_ms;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_dynamic_batching(mut self, enabled: bool) -> Self {
        self.enable_dynamic_batching = enabled;
        self
    }

    pub fn with_priority_queuing(mut self, enabled: bool) -> Self {
        self.enable_priority_queuing = enabled;
        self
    }

    pub fn with_smart_grouping(mut self, enabled: bool) -> Self {
        self.enable_smart_grouping = enabled;
        self
    }

    pub fn with_predictive_warming(mut self, enabled: bool) -> Self {
        self.enable_predictive_warming = enabled;
        self
    }

    pub fn with_caching(mut self, enabled: bool) -> Self {
        self.caching_enabled = enabled;
        self
    }

    pub fn with_intelligent_routing(mut self, enabled: bool) -> Self {
        self.intelligent_routing_enabled = enabled;
        self
    }

    pub fn with_routing_policy(mut self, policy: RoutingPolicy) -> Self {
        self.routing = policy;
        self
    }

    pub fn with_cost_split(mut self, split: CostSplit) -> Self {
        self.cost_split = split;
        self
    }

    /// Check every option. Called by each component constructor.
    pub fn validate(&self) -> Result<()> {
        for (field, size) in [
            ("l1Size", self.l1_size),
            ("l2Size", self.l2_size),
            ("l3Size", self.l3_size),
            ("maxBatchSize", self.max_batch_size),
            ("concurrency", self.concurrency),
            ("minBatchSize", self.min_batch_size),
            ("maintenanceBatchLimit", self.maintenance_batch_limit),
        ] {
            if size == 0 {
                return Err(Error::validation(field, "must be greater than zero"));
            }
        }

        for (field, ms) in [
            ("defaultTTL", self.default_ttl_ms),
            ("batchWindowMs", self.batch_window_ms),
            ("maintenanceIntervalMs", self.maintenance_interval_ms),
            ("adaptiveIntervalMs", self.adaptive_interval_ms),
            ("minWindowMs", self.min_window_ms),
        ] {
            if ms == 0 {
                return Err(Error::validation(field, "must be greater than zero"));
            }
        }
        // Both are added to the wall clock
        ttl_span("defaultTTL", self.default_ttl_ms)?;
        ttl_span("maintenanceIntervalMs", self.maintenance_interval_ms)?;

        if self.min_batch_size > self.max_batch_size {
            return Err(Error::validation(
                "minBatchSize",
                format!(
                    "{} exceeds maxBatchSize {}",
                    self.min_batch_size, self.max_batch_size
                ),
            ));
        }
        if self.max_wait_time_ms < self.batch_window_ms {
            return Err(Error::validation(
                "maxWaitTimeMs",
                format!(
                    "{} is shorter than batchWindowMs {}",
                    self.max_wait_time_ms, self.batch_window_ms
                ),
            ));
        }
        if self.min_window_ms > self.batch_window_ms {
            return Err(Error::validation(
                "minWindowMs",
                "must not exceed batchWindowMs",
            ));
        }

        check_unit_interval("targetCostReduction", self.target_cost_reduction)?;
        check_unit_interval("routing.minReliability", self.routing.min_reliability)?;
        if !(self.eviction_fraction > 0.0 && self.eviction_fraction <= 1.0) {
            return Err(Error::validation(
                "evictionFraction",
                "must be in (0, 1]",
            ));
        }
        for (field, w) in [
            ("evictionWeights.cost", self.eviction_weights.cost),
            ("evictionWeights.frequency", self.eviction_weights.frequency),
            ("evictionWeights.recency", self.eviction_weights.recency),
            ("promotionThreshold", self.promotion_threshold),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(Error::validation(field, "must be a finite, non-negative number"));
            }
        }

        Ok(())
    }
}

fn check_unit_interval(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::validation(field, format!("{} is outside [0, 1]", value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OptimizerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.l1_size, 100);
        assert_eq!(config.cost_split, CostSplit::Even);
    }

    #[test]
    fn test_from_json_accepts_documented_names() {
        let config = OptimizerConfig::from_json(
            r#"{
                "l1Size": 2,
                "defaultTTL": 1000,
                "maxBatchSize": 3,
                "batchWindowMs": 50,
                "enablePredictiveWarming": true,
                "routing": { "minReliability": 0.5 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.l1_size, 2);
        assert_eq!(config.default_ttl_ms, 1000);
        assert_eq!(config.max_batch_size, 3);
        assert_eq!(config.batch_window_ms, 50);
        assert!(config.enable_predictive_warming);
        assert_eq!(config.routing.min_reliability, 0.5);
        // Untouched fields keep defaults
        assert_eq!(config.l2_size, 1000);
    }

    #[test]
    fn test_from_json_rejects_unknown_option() {
        let err = OptimizerConfig::from_json(r#"{"l1Szie": 2}"#).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_zero_size_rejected() {
        let config = OptimizerConfig::default().with_tier_sizes(0, 10, 10);
        match config.validate() {
            Err(Error::Validation { field, .. }) => assert_eq!(field, "l1Size"),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_wait_shorter_than_window_rejected() {
        let config = OptimizerConfig::default()
            .with_batch_window_ms(500)
            .with_max_wait_time_ms(100);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_target_reduction_bounds() {
        let mut config = OptimizerConfig::default();
        config.target_cost_reduction = 1.5;
        assert!(config.validate().is_err());
        config.target_cost_reduction = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unrepresentable_durations_rejected() {
        for ttl_ms in [10u64.pow(16), u64::MAX] {
            let config = OptimizerConfig::default().with_default_ttl_ms(ttl_ms);
            match config.validate() {
                Err(Error::Validation { field, .. }) => assert_eq!(field, "defaultTTL"),
                other => panic!("expected validation error, got {:?}", other),
            }
        }

        let mut config = OptimizerConfig::default();
        config.maintenance_interval_ms = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_weight_rejected() {
        let mut config = OptimizerConfig::default();
        config.eviction_weights.recency = -1.0;
        assert!(config.validate().is_err());
    }
}
