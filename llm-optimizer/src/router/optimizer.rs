//! The optimization entry point.
//!
//! A request moves through:
//!
//! ```text
//! Submitted -> CacheCheck -> Hit -> Done
//!                         -> Miss -> RouteSelect -> Queued -> Distributed -> Cached -> Done
//!                                                -> Executed -> Cached -> Done
//! ```
//!
//! and any execution may end in `Failed` instead, which reaches the caller
//! (and, when batched, every co-member of the batch).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use super::profiles::{ProviderCostProfile, ProviderProfileRegistry, ProviderScorer, RoutingDecision};
use crate::batch::{BatchAggregator, BatchStats};
use crate::cache::{ttl_span, CacheKey, CacheStats, SetOptions, TierCache};
use crate::config::OptimizerConfig;
use crate::error::{Error, Result};
use crate::events::{EventSink, NullSink, OptimizerEvent, OptimizerEventKind};
use crate::llm::{CompletionRequest, CompletionResponse, ProviderExecutor};
use crate::maintenance::{spawn_adaptive_loop, spawn_cache_maintenance, MaintenanceHandle};
use crate::metrics::{MetricsAggregator, OptimizationMetrics};

/// Below this hit rate the report suggests cache tuning.
const LOW_HIT_RATE: f64 = 0.2;

/// Lifecycle of one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Submitted,
    CacheCheck,
    Hit,
    Miss,
    RouteSelect,
    Queued,
    Executed,
    Distributed,
    Cached,
    Done,
    Failed,
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::CacheCheck => "cache_check",
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::RouteSelect => "route_select",
            Self::Queued => "queued",
            Self::Executed => "executed",
            Self::Distributed => "distributed",
            Self::Cached => "cached",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

fn transition(request_id: &str, state: RequestState) {
    debug!(request_id, state = %state, "Request state");
}

/// Point-in-time view of every component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerStats {
    pub cache: CacheStats,
    pub batching: BatchStats,
    pub providers: Vec<ProviderCostProfile>,
}

/// Summary of how well the pipeline is meeting its cost target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub generated_at: DateTime<Utc>,
    pub metrics: OptimizationMetrics,
    pub cache_hit_rate: f64,
    pub cost_reduction: f64,
    pub reduction_percentage: f64,
    pub batching_efficiency: f64,
    pub average_cost_per_request: f64,
    pub cache: CacheStats,
    pub batching: BatchStats,
    pub target_cost_reduction: f64,
    pub target_met: bool,
    pub recommendations: Vec<String>,
}

/// Cache, routing, batching and accounting behind one entry point.
pub struct CostOptimizer {
    config: OptimizerConfig,
    cache: Arc<TierCache>,
    batcher: BatchAggregator,
    registry: Arc<ProviderProfileRegistry>,
    executor: Arc<dyn ProviderExecutor>,
    metrics: MetricsAggregator,
    scorer: Option<Arc<dyn ProviderScorer>>,
    sink: Arc<dyn EventSink>,
}

impl CostOptimizer {
    /// Build every component from one validated configuration.
    pub fn new(
        config: OptimizerConfig,
        registry: Arc<ProviderProfileRegistry>,
        executor: Arc<dyn ProviderExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(TierCache::new(&config)?);
        let batcher = BatchAggregator::new(&config, Arc::clone(&executor))?;
        Ok(Self {
            config,
            cache,
            batcher,
            registry,
            executor,
            metrics: MetricsAggregator::new(),
            scorer: None,
            sink: Arc::new(NullSink),
        })
    }

    /// Route every component's events to `sink`.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.cache = match Arc::try_unwrap(self.cache) {
            Ok(cache) => Arc::new(cache.with_event_sink(Arc::clone(&sink))),
            Err(shared) => {
                warn!("Event sink not attached to cache: cache already shared");
                shared
            }
        };
        self.batcher = self.batcher.with_event_sink(Arc::clone(&sink));
        self.sink = sink;
        self
    }

    /// Consult `scorer` before the cost rule when intelligent routing is on.
    pub fn with_scorer(mut self, scorer: Arc<dyn ProviderScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<TierCache> {
        &self.cache
    }

    pub fn batcher(&self) -> &BatchAggregator {
        &self.batcher
    }

    pub fn registry(&self) -> &Arc<ProviderProfileRegistry> {
        &self.registry
    }

    /// Serve `request` as cheaply as possible.
    #[instrument(skip(self, request), fields(request_id = %request.id, model = %request.model))]
    pub async fn optimize_request(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        transition(&request.id, RequestState::Submitted);
        validate_request(&request)?;

        let key = CacheKey::fingerprint(&request);
        if self.config.caching_enabled {
            transition(&request.id, RequestState::CacheCheck);
            if let Some(response) = self.serve_from_cache(&key, &request.id) {
                transition(&request.id, RequestState::Done);
                return Ok(response);
            }
            transition(&request.id, RequestState::Miss);
            self.metrics.record_cache_miss();
        }

        transition(&request.id, RequestState::RouteSelect);
        let decision = self.route(&request)?;
        debug!(
            provider = %decision.provider,
            reason = %decision.reason,
            "Provider selected"
        );
        self.sink.emit(
            OptimizerEvent::new(OptimizerEventKind::RequestRouted)
                .with_key(key.as_str())
                .with_provider(&decision.provider)
                .with_message(&decision.reason),
        );

        let request_id = request.id.clone();
        let ttl_ms = request.cache_ttl_ms;
        let tags = request.tags.clone();
        let individual_estimate = request.estimated_tokens() as f64 * decision.cost_per_token;
        let batchable = !request.stream && request.priority < self.config.high_priority_threshold;

        let started = Instant::now();
        let result = if batchable {
            transition(&request_id, RequestState::Queued);
            match self
                .batcher
                .add_request(request, &decision.provider, decision.cost_per_token)
            {
                Ok(handle) => handle.await,
                Err(e) => Err(e),
            }
        } else {
            self.executor.execute(request, &decision.provider).await
        };

        let mut response = match result {
            Ok(response) => response,
            Err(error) => {
                transition(&request_id, RequestState::Failed);
                warn!(provider = %decision.provider, error = %error, "Request failed");
                self.metrics.record_failure();
                self.registry.record_outcome(&decision.provider, 0, false);
                return Err(error);
            }
        };
        if response.latency_ms == 0 {
            response.latency_ms = elapsed_ms(started.elapsed());
        }
        transition(
            &request_id,
            if response.batched {
                RequestState::Distributed
            } else {
                RequestState::Executed
            },
        );

        self.registry
            .record_outcome(&decision.provider, response.latency_ms, true);
        if response.batched {
            self.metrics.record_batched(
                &decision.provider,
                &response.usage,
                individual_estimate,
                response.cost,
                response.latency_ms,
            );
        } else {
            self.metrics.record_direct(
                &decision.provider,
                &response.usage,
                response.cost,
                response.latency_ms,
            );
        }

        if self.config.caching_enabled {
            self.store(key, &response, ttl_ms, tags);
            transition(&request_id, RequestState::Cached);
        }
        transition(&request_id, RequestState::Done);
        Ok(response)
    }

    fn serve_from_cache(&self, key: &CacheKey, request_id: &str) -> Option<CompletionResponse> {
        let (hit, mut response) = self.cache.lookup_as::<CompletionResponse>(key)?;
        transition(request_id, RequestState::Hit);
        self.metrics.record_cache_hit(hit.cost);
        response.id = request_id.to_string();
        response.cached = true;
        response.batched = false;
        response.cost = 0.0;
        response.latency_ms = 0;
        response.timestamp = Utc::now();
        Some(response)
    }

    fn route(&self, request: &CompletionRequest) -> Result<RoutingDecision> {
        if let Some(provider) = &request.provider {
            let cost_per_token = self
                .registry
                .get(provider)
                .map_or(0.0, |p| p.avg_cost_per_token);
            return Ok(RoutingDecision {
                provider: provider.clone(),
                cost_per_token,
                reason: "requested by caller".to_string(),
                scored: false,
            });
        }
        let scorer = if self.config.intelligent_routing_enabled {
            self.scorer.as_deref()
        } else {
            None
        };
        self.registry.select(request, &self.config.routing, scorer)
    }

    fn store(
        &self,
        key: CacheKey,
        response: &CompletionResponse,
        ttl_ms: Option<u64>,
        tags: Vec<String>,
    ) {
        let value = match serde_json::to_value(response) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Response not cached: serialization failed");
                return;
            }
        };
        let mut options = SetOptions::new().with_cost(response.cost).with_tags(tags);
        if let Some(ttl_ms) = ttl_ms {
            options = options.with_ttl_ms(ttl_ms);
        }
        if let Err(e) = self.cache.set(key, value, options) {
            warn!(error = %e, "Response not cached");
        }
    }

    /// Counters as of now. Never mutates anything.
    pub fn get_metrics(&self) -> OptimizationMetrics {
        self.metrics.snapshot(self.cache.stats().evictions)
    }

    /// Component snapshots. Never mutates anything.
    pub fn get_stats(&self) -> OptimizerStats {
        OptimizerStats {
            cache: self.cache.stats(),
            batching: self.batcher.stats(),
            providers: self.registry.all().as_ref().clone(),
        }
    }

    /// Zero the optimization counters. Cache and batch statistics are kept.
    pub fn reset_metrics(&self) {
        self.metrics.reset(self.cache.stats().evictions);
    }

    pub fn generate_report(&self) -> OptimizationReport {
        let metrics = self.get_metrics();
        let cache = self.cache.stats();
        let batching = self.batcher.stats();
        let target = self.config.target_cost_reduction;
        let cost_reduction = metrics.cost_reduction();
        let target_met = metrics.total_requests > 0 && cost_reduction >= target;

        let mut recommendations = Vec::new();
        if self.config.caching_enabled
            && metrics.cache_hits + metrics.cache_misses > 0
            && metrics.cache_hit_rate() < LOW_HIT_RATE
        {
            recommendations.push(format!(
                "Cache hit rate is {:.1}%; consider longer TTLs or larger tiers",
                metrics.cache_hit_rate() * 100.0
            ));
        }
        if batching.batches > 0 && batching.avg_batch_size < batching.optimal_batch_size as f64 / 2.0
        {
            recommendations.push(format!(
                "Batches average {:.1} requests against an optimal size of {}; consider a longer batch window",
                batching.avg_batch_size, batching.optimal_batch_size
            ));
        }
        if metrics.failures > 0 {
            recommendations.push(format!(
                "{} requests failed upstream; review provider reliability",
                metrics.failures
            ));
        }
        if metrics.total_requests > 0 && !target_met {
            recommendations.push(format!(
                "Cost reduction {:.1}% is below the {:.1}% target",
                cost_reduction * 100.0,
                target * 100.0
            ));
        }

        OptimizationReport {
            generated_at: Utc::now(),
            cache_hit_rate: metrics.cache_hit_rate(),
            cost_reduction,
            reduction_percentage: metrics.reduction_percentage(),
            batching_efficiency: metrics.batching_efficiency(),
            average_cost_per_request: metrics.average_cost_per_request(),
            metrics,
            cache,
            batching,
            target_cost_reduction: target,
            target_met,
            recommendations,
        }
    }

    /// Start cache maintenance and, with dynamic batching, the adaptive loop.
    /// Must be called inside a tokio runtime.
    pub fn spawn_maintenance(&self) -> MaintenanceHandle {
        let mut tasks = vec![spawn_cache_maintenance(
            Arc::clone(&self.cache),
            Duration::from_millis(self.config.maintenance_interval_ms),
        )];
        if self.config.enable_dynamic_batching {
            tasks.push(spawn_adaptive_loop(
                self.batcher.clone(),
                Duration::from_millis(self.config.adaptive_interval_ms),
            ));
        }
        MaintenanceHandle::new(tasks)
    }

    /// Flush every pending batch; for shutdown.
    pub async fn flush(&self) -> usize {
        self.batcher.flush_all().await
    }
}

fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn validate_request(request: &CompletionRequest) -> Result<()> {
    if request.model.trim().is_empty() {
        return Err(Error::validation("model", "must not be empty"));
    }
    if request.messages.is_empty() {
        return Err(Error::validation("messages", "at least one message is required"));
    }
    if let Some(ttl_ms) = request.cache_ttl_ms {
        ttl_span("cacheTtlMs", ttl_ms)?;
    }
    if let Some(t) = request.temperature {
        if !(0.0..=2.0).contains(&t) {
            return Err(Error::validation("temperature", format!("{} is outside 0.0 - 2.0", t)));
        }
    }
    if request.priority > 10 {
        return Err(Error::validation("priority", "must be between 0 and 10"));
    }
    Ok(())
}
