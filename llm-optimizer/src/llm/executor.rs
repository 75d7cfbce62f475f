//! Provider executor seam.
//!
//! The optimizer never performs network I/O. Every upstream call, single or
//! combined, goes through an injected [`ProviderExecutor`]. Timeouts and
//! retry/backoff are the executor's responsibility.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::error::Result;

use super::types::{CompletionRequest, CompletionResponse, CostTracker};

/// Executes a (possibly combined) request against a provider.
#[async_trait]
pub trait ProviderExecutor: Send + Sync {
    /// Execute `request` on `provider`.
    async fn execute(&self, request: CompletionRequest, provider: &str)
        -> Result<CompletionResponse>;
}

#[async_trait]
impl<T: ProviderExecutor + ?Sized> ProviderExecutor for Arc<T> {
    async fn execute(
        &self,
        request: CompletionRequest,
        provider: &str,
    ) -> Result<CompletionResponse> {
        (**self).execute(request, provider).await
    }
}

/// Executor wrapper that tracks realized upstream spend and latency.
pub struct TrackedExecutor {
    inner: Arc<dyn ProviderExecutor>,
    costs: Arc<RwLock<CostTracker>>,
}

impl TrackedExecutor {
    pub fn new(inner: Arc<dyn ProviderExecutor>) -> Self {
        Self {
            inner,
            costs: Arc::new(RwLock::new(CostTracker::new())),
        }
    }

    /// Get current upstream cost summary.
    pub async fn costs(&self) -> CostTracker {
        self.costs.read().await.clone()
    }

    /// Reset cost tracking.
    pub async fn reset_costs(&self) {
        *self.costs.write().await = CostTracker::new();
    }
}

#[async_trait]
impl ProviderExecutor for TrackedExecutor {
    async fn execute(
        &self,
        request: CompletionRequest,
        provider: &str,
    ) -> Result<CompletionResponse> {
        let start = Instant::now();
        let mut response = self.inner.execute(request, provider).await?;
        if response.latency_ms == 0 {
            response.latency_ms = start.elapsed().as_millis() as u64;
        }

        let mut costs = self.costs.write().await;
        costs.record(provider, &response.usage, response.cost);

        Ok(response)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Deterministic executor used across the crate's tests.

    use super::*;
    use crate::error::Error;
    use crate::llm::types::TokenUsage;
    use regex::Regex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    pub(crate) struct MockExecutor {
        calls: AtomicUsize,
        fail: AtomicBool,
        delay: Option<Duration>,
        cost_per_call: f64,
        requests: Mutex<Vec<(CompletionRequest, String)>>,
    }

    impl MockExecutor {
        pub(crate) fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                delay: None,
                cost_per_call: 0.01,
                requests: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn failing() -> Self {
            let mock = Self::new();
            mock.set_failing(true);
            mock
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub(crate) fn with_cost(mut self, cost: f64) -> Self {
            self.cost_per_call = cost;
            self
        }

        pub(crate) fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub(crate) fn requests(&self) -> Vec<(CompletionRequest, String)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProviderExecutor for MockExecutor {
        async fn execute(
            &self,
            request: CompletionRequest,
            provider: &str,
        ) -> Result<CompletionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests
                .lock()
                .unwrap()
                .push((request.clone(), provider.to_string()));

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::provider_execution(provider, "upstream unavailable"));
            }

            // Answer every combined marker so the aggregator can split it back.
            let marker = Regex::new(r"\[\[REQUEST (\d+):([^\]]+)\]\]").unwrap();
            let content = request.content();
            let answers: Vec<String> = marker
                .captures_iter(&content)
                .map(|c| format!("[[REQUEST {}:{}]]\nanswer for {}", &c[1], &c[2], &c[2]))
                .collect();
            let text = if answers.is_empty() {
                format!("echo: {}", content)
            } else {
                answers.join("\n")
            };

            let tokens = request.estimated_tokens();
            Ok(CompletionResponse::new(request.id, request.model, provider, text)
                .with_usage(TokenUsage::new(tokens, 30))
                .with_cost(self.cost_per_call))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockExecutor;
    use super::*;
    use crate::llm::types::ChatMessage;

    #[tokio::test]
    async fn test_tracked_executor_records_costs() {
        let mock = Arc::new(MockExecutor::new().with_cost(0.5));
        let tracked = TrackedExecutor::new(mock.clone());

        let request = CompletionRequest::new("m").with_message(ChatMessage::user("hello"));
        let response = tracked.execute(request.clone(), "a").await.unwrap();
        assert_eq!(response.usage.input_tokens, request.estimated_tokens());
        tracked.execute(request, "b").await.unwrap();

        let costs = tracked.costs().await;
        assert_eq!(costs.request_count, 2);
        assert!((costs.total_cost - 1.0).abs() < 1e-9);
        assert_eq!(mock.calls(), 2);

        tracked.reset_costs().await;
        assert_eq!(tracked.costs().await.request_count, 0);
    }

    #[tokio::test]
    async fn test_tracked_executor_propagates_errors() {
        let tracked = TrackedExecutor::new(Arc::new(MockExecutor::failing()));
        let request = CompletionRequest::new("m").with_message(ChatMessage::user("x"));
        let err = tracked.execute(request, "a").await.unwrap_err();
        assert!(matches!(err, crate::error::Error::ProviderExecution { .. }));
        assert_eq!(tracked.costs().await.request_count, 0);
    }
}
