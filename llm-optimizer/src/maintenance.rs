//! Scheduled background work.
//!
//! Each loop is an independent tokio task doing one bounded tick per period.
//! Dropping the [`MaintenanceHandle`] stops them.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::batch::BatchAggregator;
use crate::cache::TierCache;

/// Owns the spawned maintenance tasks.
#[derive(Debug)]
pub struct MaintenanceHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    pub(crate) fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self { tasks }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Stop every task.
    pub fn shutdown(mut self) {
        self.abort_all();
        info!("Maintenance stopped");
    }

    fn abort_all(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.abort_all();
    }
}

/// Sweep, rebalance and warm `cache` once per `period`.
pub fn spawn_cache_maintenance(cache: Arc<TierCache>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            cache.run_maintenance();
        }
    })
}

/// Run the batch controller once per `period`.
pub fn spawn_adaptive_loop(batcher: BatchAggregator, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let adjustment = batcher.run_adaptive_tick();
            if !adjustment.is_noop() {
                debug!(
                    batch_size_delta = adjustment.batch_size_delta,
                    window_delta_ms = adjustment.window_delta_ms,
                    "Adaptive batching tick"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, SetOptions};
    use crate::config::OptimizerConfig;
    use crate::llm::mock::MockExecutor;
    use crate::llm::{ChatMessage, CompletionRequest};
    use serde_json::json;

    #[tokio::test]
    async fn test_cache_maintenance_sweeps_expired() {
        let cache = Arc::new(TierCache::new(&OptimizerConfig::default()).unwrap());
        cache
            .set(CacheKey::from("short"), json!(1), SetOptions::new().with_ttl_ms(5))
            .unwrap();
        cache
            .set(CacheKey::from("long"), json!(2), SetOptions::new())
            .unwrap();

        let handle = MaintenanceHandle::new(vec![spawn_cache_maintenance(
            cache.clone(),
            Duration::from_millis(10),
        )]);
        tokio::time::sleep(Duration::from_millis(80)).await;
        handle.shutdown();

        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&CacheKey::from("long")));
        assert!(cache.stats().expirations >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_loop_ticks_on_schedule() {
        let config = OptimizerConfig::default()
            .with_max_batch_size(10)
            .with_batch_window_ms(100);
        let batcher = BatchAggregator::new(&config, Arc::new(MockExecutor::new())).unwrap();

        let a = batcher
            .add_request(
                CompletionRequest::new("m").with_message(ChatMessage::user("a")),
                "p",
                0.0,
            )
            .unwrap();
        let b = batcher
            .add_request(
                CompletionRequest::new("m").with_message(ChatMessage::user("b")),
                "p",
                0.0,
            )
            .unwrap();
        a.await.unwrap();
        b.await.unwrap();
        assert_eq!(batcher.stats().window_ms, 100);

        let handle = MaintenanceHandle::new(vec![spawn_adaptive_loop(
            batcher.clone(),
            Duration::from_secs(5),
        )]);
        assert_eq!(handle.task_count(), 1);

        tokio::time::sleep(Duration::from_millis(4_000)).await;
        assert_eq!(batcher.stats().window_ms, 100);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(batcher.stats().window_ms, 120);
        drop(handle);
    }
}
