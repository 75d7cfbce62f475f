//! Provider selection and the optimization pipeline.

mod optimizer;
mod profiles;

pub use optimizer::{CostOptimizer, OptimizationReport, OptimizerStats, RequestState};
pub use profiles::{ProviderCostProfile, ProviderProfileRegistry, ProviderScorer, RoutingDecision};
