//! Request batching.
//!
//! Concurrent requests that share a batch key are queued and sent upstream
//! as one combined call. The combined response is split back out, and a
//! failed call fails every member of its batch.

mod adaptive;
mod aggregator;
mod combine;

pub use adaptive::{AdaptiveController, Adjustment, BatchSample, SAMPLE_WINDOW};
pub use aggregator::{BatchAggregator, BatchGroup, BatchHandle, BatchRequestEntry, BatchStats};
pub use combine::{
    batch_key, combine, group_key, group_members, request_marker, split_cost, split_response,
    CostShare,
};
