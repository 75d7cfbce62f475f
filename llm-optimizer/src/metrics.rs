//! Cost and savings accounting.
//!
//! Only counters are stored. Every rate is computed from them on read, so
//! the derived figures can never drift from the counts they summarize.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::llm::{CostTracker, TokenUsage};

/// Cumulative counters. They only grow until an explicit reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationMetrics {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Realized spend attributed to requests, in USD
    pub total_cost: f64,
    /// Spend avoided by cache hits and batching, in USD
    pub total_saved: f64,
    pub evictions: u64,
    pub batched_requests: u64,
    pub direct_requests: u64,
    pub failures: u64,
    pub individual_cost_estimate_sum: f64,
    pub actual_batched_cost_sum: f64,
    pub total_latency_ms: u64,
    /// Realized spend per provider
    pub costs: CostTracker,
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

impl OptimizationMetrics {
    pub fn cache_hit_rate(&self) -> f64 {
        ratio(
            self.cache_hits as f64,
            (self.cache_hits + self.cache_misses) as f64,
        )
    }

    /// Fraction of would-be spend avoided: `saved / (cost + saved)`.
    pub fn cost_reduction(&self) -> f64 {
        ratio(self.total_saved, self.total_cost + self.total_saved)
    }

    pub fn reduction_percentage(&self) -> f64 {
        self.cost_reduction() * 100.0
    }

    /// Individual cost estimates over what batched requests actually cost.
    pub fn batching_efficiency(&self) -> f64 {
        ratio(
            self.individual_cost_estimate_sum,
            self.actual_batched_cost_sum,
        )
    }

    pub fn average_cost_per_request(&self) -> f64 {
        ratio(self.total_cost, self.total_requests as f64)
    }

    /// Mean upstream latency of executed (non-cached) requests.
    pub fn average_latency_ms(&self) -> f64 {
        ratio(
            self.total_latency_ms as f64,
            (self.batched_requests + self.direct_requests) as f64,
        )
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    metrics: OptimizationMetrics,
    eviction_baseline: u64,
}

/// Accumulates [`OptimizationMetrics`] behind one lock.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    state: Mutex<MetricsState>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A cache hit that avoided `saved` in spend.
    pub fn record_cache_hit(&self, saved: f64) {
        let mut state = self.state();
        state.metrics.total_requests += 1;
        state.metrics.cache_hits += 1;
        state.metrics.total_saved += saved.max(0.0);
    }

    pub fn record_cache_miss(&self) {
        self.state().metrics.cache_misses += 1;
    }

    /// A request executed on its own.
    pub fn record_direct(&self, provider: &str, usage: &TokenUsage, cost: f64, latency_ms: u64) {
        let mut state = self.state();
        let m = &mut state.metrics;
        m.total_requests += 1;
        m.direct_requests += 1;
        m.total_cost += cost;
        m.total_latency_ms += latency_ms;
        m.costs.record(provider, usage, cost);
    }

    /// A request served by a combined batch.
    ///
    /// `individual_estimate` is what it would have cost alone; `share` is
    /// its attributed part of the combined cost.
    pub fn record_batched(
        &self,
        provider: &str,
        usage: &TokenUsage,
        individual_estimate: f64,
        share: f64,
        latency_ms: u64,
    ) {
        let mut state = self.state();
        let m = &mut state.metrics;
        m.total_requests += 1;
        m.batched_requests += 1;
        m.total_cost += share;
        m.total_saved += (individual_estimate - share).max(0.0);
        m.individual_cost_estimate_sum += individual_estimate;
        m.actual_batched_cost_sum += share;
        m.total_latency_ms += latency_ms;
        m.costs.record(provider, usage, share);
    }

    pub fn record_failure(&self) {
        let mut state = self.state();
        state.metrics.total_requests += 1;
        state.metrics.failures += 1;
    }

    /// Counters as of now; `cache_evictions` is the cache's lifetime count.
    pub fn snapshot(&self, cache_evictions: u64) -> OptimizationMetrics {
        let state = self.state();
        let mut metrics = state.metrics.clone();
        metrics.evictions = cache_evictions.saturating_sub(state.eviction_baseline);
        metrics
    }

    /// Zero every counter; evictions restart from `cache_evictions`.
    pub fn reset(&self, cache_evictions: u64) {
        let mut state = self.state();
        state.metrics = OptimizationMetrics::default();
        state.eviction_baseline = cache_evictions;
    }
}
