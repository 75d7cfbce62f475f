//! Multi-tier response cache.
//!
//! ## Example
//!
//! ```rust,ignore
//! use llm_optimizer::cache::{CacheKey, SetOptions, TierCache};
//! use llm_optimizer::OptimizerConfig;
//!
//! let cache = TierCache::new(&OptimizerConfig::default())?;
//! cache.set(CacheKey::from("k"), json!({"x": 1}), SetOptions::new().with_ttl_ms(1000))?;
//! assert_eq!(cache.get(&CacheKey::from("k")), Some(json!({"x": 1})));
//! ```

mod entry;
mod snapshot;
mod tier;

pub use entry::{
    ttl_span, AccessPattern, CacheEntry, CacheKey, CacheStats, Tier, ACCESS_HISTORY_LEN,
};
pub use snapshot::{CacheSnapshot, ImportSummary, SNAPSHOT_VERSION};
pub use tier::{CacheHit, MaintenanceReport, SetOptions, TierCache};
