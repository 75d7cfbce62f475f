//! Observable optimizer events.
//!
//! Events are for external monitoring only; nothing in the pipeline depends
//! on them being delivered. Sinks are injected into the components that emit,
//! there is no process-wide bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use crate::cache::Tier;

/// Kinds of events emitted by the cache, aggregator and router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptimizerEventKind {
    CacheHit,
    CacheMiss,
    CacheEvict,
    CachePromote,
    CacheDemote,
    CacheExpire,
    CacheInvalidate,
    BatchCompleted,
    BatchFailed,
    RequestRouted,
}

impl std::fmt::Display for OptimizerEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CacheHit => "CACHE_HIT",
            Self::CacheMiss => "CACHE_MISS",
            Self::CacheEvict => "CACHE_EVICT",
            Self::CachePromote => "CACHE_PROMOTE",
            Self::CacheDemote => "CACHE_DEMOTE",
            Self::CacheExpire => "CACHE_EXPIRE",
            Self::CacheInvalidate => "CACHE_INVALIDATE",
            Self::BatchCompleted => "BATCH_COMPLETED",
            Self::BatchFailed => "BATCH_FAILED",
            Self::RequestRouted => "REQUEST_ROUTED",
        };
        write!(f, "{}", s)
    }
}

/// A single event with enough fields to reconstruct a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerEvent {
    pub kind: OptimizerEventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    /// Destination tier for promotions and demotions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_tier: Option<Tier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OptimizerEvent {
    pub fn new(kind: OptimizerEventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            key: None,
            tier: None,
            to_tier: None,
            batch_id: None,
            request_count: None,
            latency_ms: None,
            provider: None,
            message: None,
        }
    }

    pub fn cache_hit(key: impl Into<String>, tier: Tier) -> Self {
        Self::new(OptimizerEventKind::CacheHit)
            .with_key(key)
            .with_tier(tier)
    }

    pub fn cache_miss(key: impl Into<String>) -> Self {
        Self::new(OptimizerEventKind::CacheMiss).with_key(key)
    }

    pub fn cache_move(kind: OptimizerEventKind, key: impl Into<String>, from: Tier, to: Tier) -> Self {
        let mut event = Self::new(kind).with_key(key).with_tier(from);
        event.to_tier = Some(to);
        event
    }

    pub fn batch_completed(
        batch_id: impl Into<String>,
        request_count: usize,
        latency_ms: u64,
        provider: impl Into<String>,
    ) -> Self {
        let mut event = Self::new(OptimizerEventKind::BatchCompleted);
        event.batch_id = Some(batch_id.into());
        event.request_count = Some(request_count);
        event.latency_ms = Some(latency_ms);
        event.provider = Some(provider.into());
        event
    }

    pub fn batch_failed(
        batch_id: impl Into<String>,
        request_count: usize,
        error: impl Into<String>,
    ) -> Self {
        let mut event = Self::new(OptimizerEventKind::BatchFailed);
        event.batch_id = Some(batch_id.into());
        event.request_count = Some(request_count);
        event.message = Some(error.into());
        event
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Format as a single log line.
    pub fn as_log_line(&self) -> String {
        let mut line = format!("[{}] {}", self.timestamp.format("%H:%M:%S%.3f"), self.kind);
        if let Some(key) = &self.key {
            line.push_str(&format!(" key={}", key));
        }
        if let Some(tier) = self.tier {
            line.push_str(&format!(" tier={}", tier));
        }
        if let Some(to) = self.to_tier {
            line.push_str(&format!(" to={}", to));
        }
        if let Some(batch_id) = &self.batch_id {
            line.push_str(&format!(" batch={}", batch_id));
        }
        if let Some(n) = self.request_count {
            line.push_str(&format!(" requests={}", n));
        }
        if let Some(ms) = self.latency_ms {
            line.push_str(&format!(" latency={}ms", ms));
        }
        line
    }
}

/// Receives optimizer events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: OptimizerEvent);
}

/// Broadcast-based sink; subscribers that fall behind lose old events.
pub struct BroadcastSink {
    sender: broadcast::Sender<OptimizerEvent>,
}

impl BroadcastSink {
    /// Create new broadcast sink with channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OptimizerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: OptimizerEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}

/// Sink that stores events in a Vec.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    events: Arc<RwLock<Vec<OptimizerEvent>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OptimizerEvent> {
        match self.events.read() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count(&self, kind: OptimizerEventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }

    pub fn clear(&self) {
        match self.events.write() {
            Ok(mut events) => events.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: OptimizerEvent) {
        match self.events.write() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Sink that discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: OptimizerEvent) {}
}
