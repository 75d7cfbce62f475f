//! Pending queues, flush triggers and batch execution.
//!
//! Each batch key owns a queue behind its own lock, so unrelated keys never
//! contend. A flush detaches the whole queue under that lock and bumps the
//! queue's generation; a flush timer whose generation no longer matches does
//! nothing when it fires. Every detached entry is resolved exactly once,
//! either with its share of the combined response or with the batch error.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::adaptive::{AdaptiveController, Adjustment, BatchSample};
use super::combine::{batch_key, combine, split_cost, split_response};
use crate::config::{CostSplit, OptimizerConfig};
use crate::error::{Error, Result};
use crate::events::{EventSink, NullSink, OptimizerEvent};
use crate::llm::{CompletionRequest, CompletionResponse, ProviderExecutor};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A queued request and the only sender able to resolve it.
#[derive(Debug)]
pub struct BatchRequestEntry {
    pub request: CompletionRequest,
    pub provider: String,
    pub priority: u8,
    pub enqueued_at: Instant,
    pub estimated_tokens: u64,
    pub estimated_cost: f64,
    completion: oneshot::Sender<Result<CompletionResponse>>,
}

impl BatchRequestEntry {
    /// Resolve this entry's handle. Consumes the entry so it cannot resolve twice.
    fn resolve(self, result: Result<CompletionResponse>) {
        if self.completion.send(result).is_err() {
            debug!(request_id = %self.request.id, "Batch member handle dropped before resolution");
        }
    }
}

/// Entries flushed together; lives only for one execute/distribute cycle.
#[derive(Debug)]
pub struct BatchGroup {
    pub id: String,
    pub batch_key: String,
    pub provider: String,
    pub entries: Vec<BatchRequestEntry>,
    pub estimated_tokens: u64,
    pub max_priority: u8,
    pub created_at: DateTime<Utc>,
}

impl BatchGroup {
    fn new(batch_key: String, entries: Vec<BatchRequestEntry>) -> Self {
        let provider = entries
            .first()
            .map(|e| e.provider.clone())
            .unwrap_or_default();
        Self {
            id: Uuid::new_v4().to_string(),
            estimated_tokens: entries.iter().map(|e| e.estimated_tokens).sum(),
            max_priority: entries.iter().map(|e| e.priority).max().unwrap_or(0),
            batch_key,
            provider,
            entries,
            created_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wait of the oldest member at `now`.
    fn oldest_wait(&self, now: Instant) -> Duration {
        self.entries
            .iter()
            .map(|e| now.saturating_duration_since(e.enqueued_at))
            .max()
            .unwrap_or_default()
    }

    fn reject_all(self, error: &Error) {
        for entry in self.entries {
            entry.resolve(Err(error.clone()));
        }
    }
}

/// Resolve-once future returned by [`BatchAggregator::add_request`].
#[derive(Debug)]
pub struct BatchHandle {
    batch_key: String,
    request_id: String,
    receiver: oneshot::Receiver<Result<CompletionResponse>>,
}

impl BatchHandle {
    pub fn batch_key(&self) -> &str {
        &self.batch_key
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Future for BatchHandle {
    type Output = Result<CompletionResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::BatchDropped {
                batch_key: self.batch_key.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Aggregator counters and controller state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    pub batches: u64,
    pub requests: u64,
    pub failures: u64,
    pub avg_batch_size: f64,
    pub avg_wait_ms: f64,
    /// Mean of individual cost estimate over actual combined cost
    pub efficiency_gain: f64,
    pub optimal_batch_size: usize,
    pub window_ms: u64,
    pub pending: usize,
}

#[derive(Debug, Default)]
struct Counters {
    batches: u64,
    requests: u64,
    failures: u64,
    total_wait_ms: u64,
    efficiency_sum: f64,
}

#[derive(Debug, Default)]
struct PendingQueue {
    entries: Vec<BatchRequestEntry>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

impl PendingQueue {
    fn insert(&mut self, entry: BatchRequestEntry, by_priority: bool) {
        if by_priority {
            // Stable: after every queued entry of equal or higher priority.
            let at = self
                .entries
                .iter()
                .position(|e| e.priority < entry.priority)
                .unwrap_or(self.entries.len());
            self.entries.insert(at, entry);
        } else {
            self.entries.push(entry);
        }
    }

    fn oldest_wait(&self, now: Instant) -> Duration {
        self.entries
            .iter()
            .map(|e| now.saturating_duration_since(e.enqueued_at))
            .max()
            .unwrap_or_default()
    }

    /// Take every entry and invalidate any armed timer.
    fn detach(&mut self) -> Vec<BatchRequestEntry> {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        std::mem::take(&mut self.entries)
    }
}

struct AggregatorInner {
    max_batch_size: usize,
    batch_window_ms: u64,
    max_wait: Duration,
    high_priority_threshold: u8,
    dynamic_batching: bool,
    priority_queuing: bool,
    smart_grouping: bool,
    cost_split: CostSplit,
    queues: Mutex<HashMap<String, Arc<Mutex<PendingQueue>>>>,
    controller: Mutex<AdaptiveController>,
    counters: Mutex<Counters>,
    permits: Semaphore,
    executor: Arc<dyn ProviderExecutor>,
    sink: Arc<dyn EventSink>,
}

/// Groups compatible in-flight requests into single upstream calls.
#[derive(Clone)]
pub struct BatchAggregator {
    inner: Arc<AggregatorInner>,
}

impl BatchAggregator {
    pub fn new(config: &OptimizerConfig, executor: Arc<dyn ProviderExecutor>) -> Result<Self> {
        config.validate()?;
        let controller = AdaptiveController::new(
            config.max_batch_size,
            config.min_batch_size,
            config.batch_window_ms,
            config.min_window_ms,
            config.max_wait_time_ms,
        );
        Ok(Self {
            inner: Arc::new(AggregatorInner {
                max_batch_size: config.max_batch_size,
                batch_window_ms: config.batch_window_ms,
                max_wait: Duration::from_millis(config.max_wait_time_ms),
                high_priority_threshold: config.high_priority_threshold,
                dynamic_batching: config.enable_dynamic_batching,
                priority_queuing: config.enable_priority_queuing,
                smart_grouping: config.enable_smart_grouping,
                cost_split: config.cost_split,
                queues: Mutex::new(HashMap::new()),
                controller: Mutex::new(controller),
                counters: Mutex::new(Counters::default()),
                permits: Semaphore::new(config.concurrency),
                executor,
                sink: Arc::new(NullSink),
            }),
        })
    }

    /// Route batch events to `sink`. Must be called before any request is queued.
    pub fn with_event_sink(self, sink: Arc<dyn EventSink>) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.sink = sink;
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                warn!("Event sink ignored: aggregator already shared");
                Self { inner }
            }
        }
    }

    /// Queue `request` for `provider` and return its resolve-once handle.
    ///
    /// `cost_per_token` prices the request as if it were sent alone, which
    /// feeds the efficiency estimate. Must be called inside a tokio runtime.
    pub fn add_request(
        &self,
        request: CompletionRequest,
        provider: &str,
        cost_per_token: f64,
    ) -> Result<BatchHandle> {
        if request.stream {
            return Err(Error::validation("stream", "streaming requests cannot be batched"));
        }
        if provider.is_empty() {
            return Err(Error::validation("provider", "must not be empty"));
        }

        let key = batch_key(&request, provider);
        let (completion, receiver) = oneshot::channel();
        let estimated_tokens = request.estimated_tokens();
        let handle = BatchHandle {
            batch_key: key.clone(),
            request_id: request.id.clone(),
            receiver,
        };
        let entry = BatchRequestEntry {
            provider: provider.to_string(),
            priority: request.priority,
            enqueued_at: Instant::now(),
            estimated_tokens,
            estimated_cost: estimated_tokens as f64 * cost_per_token,
            request,
            completion,
        };

        self.inner.enqueue(key, entry);
        Ok(handle)
    }

    /// Force every pending queue out and wait for all of them to finish.
    /// Returns the number of batches flushed.
    pub async fn flush_all(&self) -> usize {
        let queues: Vec<(String, Arc<Mutex<PendingQueue>>)> = lock(&self.inner.queues)
            .iter()
            .map(|(k, q)| (k.clone(), Arc::clone(q)))
            .collect();

        let detached: Vec<(String, Vec<BatchRequestEntry>)> = queues
            .into_iter()
            .filter_map(|(key, queue)| {
                let entries = lock(&queue).detach();
                (!entries.is_empty()).then_some((key, entries))
            })
            .collect();

        let count = detached.len();
        if count > 0 {
            info!(batches = count, "Flushing all pending batches");
        }
        join_all(
            detached
                .into_iter()
                .map(|(key, entries)| Arc::clone(&self.inner).execute(key, entries)),
        )
        .await;
        count
    }

    /// Run one adaptive control tick. A no-op when dynamic batching is off.
    pub fn run_adaptive_tick(&self) -> Adjustment {
        if !self.inner.dynamic_batching {
            return Adjustment::default();
        }
        let mut controller = lock(&self.inner.controller);
        let adjustment = controller.adjust();
        if !adjustment.is_noop() {
            debug!(
                optimal_batch_size = controller.optimal_batch_size(),
                window_ms = controller.window_ms(),
                "Adjusted batching parameters"
            );
        }
        adjustment
    }

    /// Requests queued and not yet flushed.
    pub fn pending_count(&self) -> usize {
        self.inner.queue_snapshot().iter().map(|(_, n)| n).sum()
    }

    /// Batch keys that currently hold queued requests.
    pub fn pending_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .queue_snapshot()
            .into_iter()
            .filter(|(_, n)| *n > 0)
            .map(|(k, _)| k)
            .collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> BatchStats {
        let pending = self.pending_count();
        let (optimal_batch_size, window_ms) = self.inner.current_limits();
        let counters = lock(&self.inner.counters);
        let per_batch = |total: f64| {
            if counters.batches == 0 {
                0.0
            } else {
                total / counters.batches as f64
            }
        };
        BatchStats {
            batches: counters.batches,
            requests: counters.requests,
            failures: counters.failures,
            avg_batch_size: per_batch(counters.requests as f64),
            avg_wait_ms: per_batch(counters.total_wait_ms as f64),
            efficiency_gain: per_batch(counters.efficiency_sum),
            optimal_batch_size,
            window_ms,
            pending,
        }
    }
}

impl AggregatorInner {
    /// Current size trigger and window length.
    fn current_limits(&self) -> (usize, u64) {
        if self.dynamic_batching {
            let controller = lock(&self.controller);
            (controller.optimal_batch_size(), controller.window_ms())
        } else {
            (self.max_batch_size, self.batch_window_ms)
        }
    }

    fn queue_snapshot(&self) -> Vec<(String, usize)> {
        let queues: Vec<(String, Arc<Mutex<PendingQueue>>)> = lock(&self.queues)
            .iter()
            .map(|(k, q)| (k.clone(), Arc::clone(q)))
            .collect();
        queues
            .into_iter()
            .map(|(k, q)| {
                let len = lock(&q).entries.len();
                (k, len)
            })
            .collect()
    }

    fn queue_for(&self, key: &str) -> Arc<Mutex<PendingQueue>> {
        let mut queues = lock(&self.queues);
        Arc::clone(queues.entry(key.to_string()).or_default())
    }

    fn enqueue(self: &Arc<Self>, key: String, entry: BatchRequestEntry) {
        let (max_size, window_ms) = self.current_limits();
        let priority = entry.priority;
        let queue = self.queue_for(&key);

        let detached = {
            let mut queue = lock(&queue);
            queue.insert(entry, self.priority_queuing);

            let oldest_wait = queue.oldest_wait(Instant::now());
            let reason = if queue.entries.len() >= max_size {
                Some("size")
            } else if priority >= self.high_priority_threshold {
                Some("priority")
            } else if oldest_wait >= self.max_wait {
                Some("max_wait")
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    debug!(batch_key = %key, reason, size = queue.entries.len(), "Flush triggered");
                    Some(queue.detach())
                }
                None => {
                    let delay = Duration::from_millis(window_ms).min(self.max_wait - oldest_wait);
                    self.arm_timer(&key, &mut queue, delay);
                    None
                }
            }
        };

        if let Some(entries) = detached {
            let inner = Arc::clone(self);
            tokio::spawn(inner.execute(key, entries));
        }
    }

    /// (Re)arm the queue's flush timer; any earlier timer becomes stale.
    fn arm_timer(self: &Arc<Self>, key: &str, queue: &mut PendingQueue, delay: Duration) {
        queue.generation += 1;
        if let Some(previous) = queue.timer.take() {
            previous.abort();
        }
        let generation = queue.generation;
        let inner = Arc::clone(self);
        let key = key.to_string();
        queue.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.flush_on_timer(key, generation);
        }));
    }

    fn flush_on_timer(self: Arc<Self>, key: String, generation: u64) {
        let queue = self.queue_for(&key);
        let entries = {
            let mut queue = lock(&queue);
            if queue.generation != generation {
                return;
            }
            // Release our own handle without aborting the running task.
            queue.timer.take();
            queue.generation += 1;
            std::mem::take(&mut queue.entries)
        };
        if !entries.is_empty() {
            debug!(batch_key = %key, size = entries.len(), "Flush triggered by window");
            tokio::spawn(self.execute(key, entries));
        }
    }

    #[instrument(skip(self, entries), fields(size = entries.len()))]
    async fn execute(self: Arc<Self>, batch_key: String, entries: Vec<BatchRequestEntry>) {
        if entries.is_empty() {
            return;
        }
        let group = BatchGroup::new(batch_key, entries);
        let wait = group.oldest_wait(Instant::now());

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                let error = Error::Internal(format!("batch executor closed: {}", e));
                self.record_failure(&group, &error);
                group.reject_all(&error);
                return;
            }
        };

        let started = Instant::now();
        let result = if group.len() == 1 {
            let request = group.entries[0].request.clone();
            self.executor.execute(request, &group.provider).await
        } else {
            let requests: Vec<&CompletionRequest> =
                group.entries.iter().map(|e| &e.request).collect();
            let combined = combine(&group.id, &requests, self.smart_grouping);
            self.executor.execute(combined, &group.provider).await
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) => self.distribute(group, response, wait, latency_ms),
            Err(error) => {
                self.record_failure(&group, &error);
                group.reject_all(&error);
            }
        }
    }

    fn distribute(
        &self,
        group: BatchGroup,
        response: CompletionResponse,
        wait: Duration,
        latency_ms: u64,
    ) {
        let size = group.len();
        let estimated: f64 = group.entries.iter().map(|e| e.estimated_cost).sum();
        // Zero-cost responses cannot be compared; count the calls saved instead.
        let efficiency = if response.cost > 0.0 {
            estimated / response.cost
        } else {
            size as f64
        };
        self.record_success(size, wait, efficiency);

        info!(
            batch_id = %group.id,
            batch_key = %group.batch_key,
            request_count = size,
            latency_ms,
            "Batch completed"
        );
        self.sink.emit(OptimizerEvent::batch_completed(
            &group.id,
            size,
            latency_ms,
            &group.provider,
        ));

        if size == 1 {
            if let Some(entry) = group.entries.into_iter().next() {
                let mut single = response;
                single.id = entry.request.id.clone();
                if single.latency_ms == 0 {
                    single.latency_ms = latency_ms;
                }
                entry.resolve(Ok(single));
            }
            return;
        }

        let sections = split_response(&response.content);
        let tokens: Vec<u64> = group.entries.iter().map(|e| e.estimated_tokens).collect();
        let shares = split_cost(&response.usage, response.cost, &tokens, self.cost_split);

        for (entry, share) in group.entries.into_iter().zip(shares) {
            let content = sections
                .get(&entry.request.id)
                .cloned()
                .unwrap_or_else(|| response.content.clone());
            let mut member = CompletionResponse::new(
                entry.request.id.clone(),
                response.model.clone(),
                group.provider.clone(),
                content,
            )
            .with_usage(share.usage)
            .with_cost(share.cost);
            member.stop_reason = response.stop_reason;
            member.batched = true;
            member.latency_ms = latency_ms;
            entry.resolve(Ok(member));
        }
    }

    fn record_success(&self, size: usize, wait: Duration, efficiency: f64) {
        let wait_ms = wait.as_millis() as u64;
        {
            let mut counters = lock(&self.counters);
            counters.batches += 1;
            counters.requests += size as u64;
            counters.total_wait_ms += wait_ms;
            counters.efficiency_sum += efficiency;
        }
        lock(&self.controller).record(BatchSample {
            size,
            wait_ms,
            efficiency,
        });
    }

    fn record_failure(&self, group: &BatchGroup, error: &Error) {
        lock(&self.counters).failures += 1;
        warn!(
            batch_id = %group.id,
            batch_key = %group.batch_key,
            request_count = group.len(),
            error = %error,
            "Batch failed; rejecting every member"
        );
        self.sink.emit(OptimizerEvent::batch_failed(
            &group.id,
            group.len(),
            error.to_string(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CollectingSink, OptimizerEventKind};
    use crate::llm::mock::MockExecutor;
    use crate::llm::ChatMessage;
    use async_trait::async_trait;

    fn config() -> OptimizerConfig {
        OptimizerConfig::default()
            .with_max_batch_size(3)
            .with_batch_window_ms(50)
    }

    fn req(id: &str) -> CompletionRequest {
        CompletionRequest::new("gpt-test")
            .with_id(id)
            .with_message(ChatMessage::user(format!("question {}", id)))
    }

    fn aggregator(config: &OptimizerConfig, mock: &Arc<MockExecutor>) -> BatchAggregator {
        BatchAggregator::new(config, mock.clone()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_makes_one_call_referencing_all_ids() {
        let mock = Arc::new(MockExecutor::new());
        let agg = aggregator(&config(), &mock);

        let a = agg.add_request(req("r1"), "p", 0.0).unwrap();
        tokio::time::advance(Duration::from_millis(3)).await;
        let b = agg.add_request(req("r2"), "p", 0.0).unwrap();
        tokio::time::advance(Duration::from_millis(3)).await;
        let c = agg.add_request(req("r3"), "p", 0.0).unwrap();

        let (a, b, c) = (a.await.unwrap(), b.await.unwrap(), c.await.unwrap());
        assert_eq!(mock.calls(), 1);

        let (combined, provider) = &mock.requests()[0];
        assert_eq!(provider, "p");
        let payload = combined.content();
        for id in ["r1", "r2", "r3"] {
            assert!(payload.contains(id), "combined payload is missing {}", id);
        }

        assert!(a.batched && b.batched && c.batched);
        assert_eq!(a.id, "r1");
        assert_eq!(b.content, "answer for r2");
        assert_eq!(c.content, "answer for r3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_flush_disarms_pending_window_timer() {
        let mock = Arc::new(MockExecutor::new());
        let agg = aggregator(&config(), &mock);

        // Window timer armed for 50ms, size trigger fires just before it
        let a = agg.add_request(req("r1"), "p", 0.0).unwrap();
        tokio::time::advance(Duration::from_millis(45)).await;
        let b = agg.add_request(req("r2"), "p", 0.0).unwrap();
        let c = agg.add_request(req("r3"), "p", 0.0).unwrap();
        a.await.unwrap();
        b.await.unwrap();
        c.await.unwrap();

        // Past the window and max wait
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(mock.calls(), 1);
        assert_eq!(agg.stats().batches, 1);
        assert_eq!(agg.stats().requests, 3);
        assert_eq!(agg.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_rejects_every_member() {
        let mock = Arc::new(MockExecutor::failing());
        let sink = Arc::new(CollectingSink::new());
        let agg = aggregator(&config(), &mock).with_event_sink(sink.clone());

        let handles: Vec<BatchHandle> = ["a", "b", "c"]
            .iter()
            .map(|id| agg.add_request(req(id), "p", 0.0).unwrap())
            .collect();
        let results = join_all(handles).await;

        assert_eq!(mock.calls(), 1);
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(Error::ProviderExecution { .. }))));
        assert_eq!(agg.stats().failures, 1);
        assert_eq!(sink.count(OptimizerEventKind::BatchFailed), 1);
        assert_eq!(sink.count(OptimizerEventKind::BatchCompleted), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_flushes_partial_batch() {
        let mock = Arc::new(MockExecutor::new());
        let cfg = config().with_max_batch_size(10).with_batch_window_ms(100);
        let agg = aggregator(&cfg, &mock);

        let start = Instant::now();
        let a = agg.add_request(req("a"), "p", 0.0).unwrap();
        let b = agg.add_request(req("b"), "p", 0.0).unwrap();
        assert_eq!(agg.pending_count(), 2);

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(mock.calls(), 1);
        assert!(a.batched && b.batched);
        assert_eq!(agg.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_keys_are_not_combined() {
        let mock = Arc::new(MockExecutor::new());
        let agg = aggregator(&config(), &mock);

        let a = agg.add_request(req("a"), "p", 0.0).unwrap();
        let b = agg.add_request(req("b").with_system("be brief"), "p", 0.0).unwrap();
        assert_ne!(a.batch_key(), b.batch_key());
        assert_eq!(agg.pending_keys().len(), 2);

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(mock.calls(), 2);
        assert!(!a.batched && !b.batched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_priority_flushes_immediately() {
        let mock = Arc::new(MockExecutor::new());
        let cfg = config().with_max_batch_size(10).with_batch_window_ms(100);
        let agg = aggregator(&cfg, &mock);

        let start = Instant::now();
        let a = agg.add_request(req("a"), "p", 0.0).unwrap();
        let b = agg.add_request(req("b").with_priority(9), "p", 0.0).unwrap();
        assert_eq!(agg.pending_count(), 0);

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(mock.calls(), 1);
        assert!(a.batched && b.batched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_order_in_combined_payload() {
        let mock = Arc::new(MockExecutor::new());
        let agg = aggregator(&config(), &mock);

        let handles = vec![
            agg.add_request(req("low").with_priority(1), "p", 0.0).unwrap(),
            agg.add_request(req("mid").with_priority(5), "p", 0.0).unwrap(),
            agg.add_request(req("hi").with_priority(7), "p", 0.0).unwrap(),
        ];
        join_all(handles).await;

        let payload = mock.requests()[0].0.content();
        let pos = |id: &str| payload.find(&format!(":{}]]", id)).unwrap();
        assert!(pos("hi") < pos("mid"));
        assert!(pos("mid") < pos("low"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_order_without_priority_queuing() {
        let mock = Arc::new(MockExecutor::new());
        let agg = aggregator(&config().with_priority_queuing(false), &mock);

        let handles = vec![
            agg.add_request(req("low").with_priority(1), "p", 0.0).unwrap(),
            agg.add_request(req("hi").with_priority(7), "p", 0.0).unwrap(),
            agg.add_request(req("mid").with_priority(5), "p", 0.0).unwrap(),
        ];
        join_all(handles).await;

        let payload = mock.requests()[0].0.content();
        let pos = |id: &str| payload.find(&format!(":{}]]", id)).unwrap();
        assert!(pos("low") < pos("hi"));
        assert!(pos("hi") < pos("mid"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_wait_bounds_rearmed_window() {
        let mock = Arc::new(MockExecutor::new());
        let cfg = config()
            .with_max_batch_size(10)
            .with_batch_window_ms(100)
            .with_max_wait_time_ms(150);
        let agg = aggregator(&cfg, &mock);

        let start = Instant::now();
        let a = agg.add_request(req("a"), "p", 0.0).unwrap();
        tokio::time::advance(Duration::from_millis(90)).await;
        let b = agg.add_request(req("b"), "p", 0.0).unwrap();

        a.await.unwrap();
        b.await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_millis(190));
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_even_cost_split() {
        let mock = Arc::new(MockExecutor::new().with_cost(0.03));
        let agg = aggregator(&config(), &mock);

        let handles: Vec<BatchHandle> = ["a", "b", "c"]
            .iter()
            .map(|id| agg.add_request(req(id), "p", 0.0).unwrap())
            .collect();
        for result in join_all(handles).await {
            let response = result.unwrap();
            assert!((response.cost - 0.01).abs() < 1e-12);
        }
    }

    struct PlainExecutor;

    #[async_trait]
    impl ProviderExecutor for PlainExecutor {
        async fn execute(
            &self,
            request: CompletionRequest,
            provider: &str,
        ) -> Result<CompletionResponse> {
            Ok(CompletionResponse::new(request.id, request.model, provider, "shared answer"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_markers_give_full_content() {
        let agg = BatchAggregator::new(&config(), Arc::new(PlainExecutor)).unwrap();
        let handles: Vec<BatchHandle> = ["a", "b", "c"]
            .iter()
            .map(|id| agg.add_request(req(id), "p", 0.0).unwrap())
            .collect();
        for result in join_all(handles).await {
            assert_eq!(result.unwrap().content, "shared answer");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limits_upstream_calls() {
        let mock = Arc::new(MockExecutor::new().with_delay(Duration::from_millis(100)));
        let agg = aggregator(&config().with_concurrency(1), &mock);

        let start = Instant::now();
        let a = agg.add_request(req("a").with_priority(9), "p", 0.0).unwrap();
        let b = agg.add_request(req("b").with_priority(9), "q", 0.0).unwrap();
        a.await.unwrap();
        b.await.unwrap();

        assert_eq!(mock.calls(), 2);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_all() {
        let mock = Arc::new(MockExecutor::new());
        let cfg = config().with_max_batch_size(10).with_batch_window_ms(100);
        let agg = aggregator(&cfg, &mock);

        let start = Instant::now();
        let a = agg.add_request(req("a"), "p", 0.0).unwrap();
        let b = agg.add_request(req("b"), "p", 0.0).unwrap();
        let c = agg.add_request(req("c"), "q", 0.0).unwrap();

        assert_eq!(agg.flush_all().await, 2);
        assert_eq!(agg.pending_count(), 0);
        assert!(a.await.unwrap().batched);
        assert!(b.await.is_ok());
        assert!(c.await.is_ok());
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(mock.calls(), 2);
        assert_eq!(agg.flush_all().await, 0);
    }

    #[tokio::test]
    async fn test_stream_requests_rejected() {
        let mock = Arc::new(MockExecutor::new());
        let agg = aggregator(&config(), &mock);
        let err = agg
            .add_request(req("s").with_stream(true), "p", 0.0)
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(agg.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_sender_surfaces_as_batch_dropped() {
        let (completion, receiver) = oneshot::channel();
        drop(completion);
        let handle = BatchHandle {
            batch_key: "p|m|t=none|sys=0".to_string(),
            request_id: "x".to_string(),
            receiver,
        };
        match handle.await {
            Err(Error::BatchDropped { batch_key }) => assert_eq!(batch_key, "p|m|t=none|sys=0"),
            other => panic!("expected BatchDropped, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_tick_grows_window_for_underfilled_batches() {
        let mock = Arc::new(MockExecutor::new());
        let cfg = config().with_max_batch_size(10).with_batch_window_ms(100);
        let agg = aggregator(&cfg, &mock);

        let a = agg.add_request(req("a"), "p", 0.0).unwrap();
        let b = agg.add_request(req("b"), "p", 0.0).unwrap();
        a.await.unwrap();
        b.await.unwrap();

        let stats = agg.stats();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.avg_wait_ms, 100.0);

        let adjustment = agg.run_adaptive_tick();
        assert_eq!(adjustment.window_delta_ms, 20);
        assert_eq!(agg.stats().window_ms, 120);
    }

    #[tokio::test]
    async fn test_adaptive_tick_noop_when_disabled() {
        let mock = Arc::new(MockExecutor::new());
        let agg = aggregator(&config().with_dynamic_batching(false), &mock);
        assert!(agg.run_adaptive_tick().is_noop());
        assert_eq!(agg.stats().optimal_batch_size, 3);
        assert_eq!(agg.stats().window_ms, 50);
    }
}
