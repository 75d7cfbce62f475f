//! # llm-optimizer
//!
//! A cost-optimization layer for LLM completion traffic. It sits between
//! callers and providers and cuts the number and cost of upstream calls
//! without changing what callers observe.
//!
//! ## Core Components
//!
//! - **Cache**: three-tier response cache with cost-aware eviction
//! - **Batch**: aggregator that folds similar in-flight requests into one call
//! - **Router**: provider profiles and the [`CostOptimizer`] entry point
//! - **Metrics**: counters with rates derived on read
//! - **Events**: injectable sinks for monitoring
//!
//! The crate performs no network I/O. Every upstream call goes through an
//! injected [`ProviderExecutor`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use llm_optimizer::{
//!     ChatMessage, CompletionRequest, CostOptimizer, OptimizerConfig, ProviderCostProfile,
//!     ProviderProfileRegistry,
//! };
//!
//! let registry = Arc::new(ProviderProfileRegistry::with_profiles(vec![
//!     ProviderCostProfile::new("openai", 0.000003),
//!     ProviderCostProfile::new("local", 0.0000001),
//! ])?);
//! let optimizer = CostOptimizer::new(OptimizerConfig::default(), registry, executor)?;
//! let _maintenance = optimizer.spawn_maintenance();
//!
//! let response = optimizer
//!     .optimize_request(CompletionRequest::new("gpt-4o").with_message(ChatMessage::user("Hi")))
//!     .await?;
//! println!("{} (cached: {})", response.content, response.cached);
//! ```

pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod llm;
pub mod maintenance;
pub mod metrics;
pub mod router;

#[cfg(test)]
mod proptest;

// Re-exports for convenience
pub use batch::{BatchAggregator, BatchHandle, BatchStats};
pub use cache::{CacheKey, CacheSnapshot, CacheStats, SetOptions, Tier, TierCache};
pub use config::{CostSplit, EvictionWeights, OptimizerConfig, RoutingPolicy};
pub use error::{Error, Result};
pub use events::{
    BroadcastSink, CollectingSink, EventSink, NullSink, OptimizerEvent, OptimizerEventKind,
};
pub use llm::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, CostTracker, ProviderExecutor,
    TokenUsage, TrackedExecutor,
};
pub use maintenance::MaintenanceHandle;
pub use metrics::{MetricsAggregator, OptimizationMetrics};
pub use router::{
    CostOptimizer, OptimizationReport, OptimizerStats, ProviderCostProfile,
    ProviderProfileRegistry, ProviderScorer, RoutingDecision,
};
