//! LLM types for requests, responses, and cost accounting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Completion request as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Caller-visible request id
    pub id: String,
    /// Model to use
    pub model: String,
    /// Provider override; when unset the router picks one
    pub provider: Option<String>,
    /// System prompt
    pub system: Option<String>,
    /// Conversation messages
    pub messages: Vec<ChatMessage>,
    /// Temperature (0.0 - 2.0)
    pub temperature: Option<f64>,
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
    /// Streaming requests are never batched
    pub stream: bool,
    /// Scheduling priority, 0 (lowest) to 10
    pub priority: u8,
    /// Tags attached to the cached response
    pub tags: Vec<String>,
    /// TTL override for the cached response, in milliseconds
    pub cache_ttl_ms: Option<u64>,
    /// Metadata for tracking
    pub metadata: HashMap<String, String>,
}

impl Default for CompletionRequest {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            model: String::new(),
            provider: None,
            system: None,
            messages: Vec::new(),
            temperature: None,
            max_tokens: None,
            stream: false,
            priority: 5,
            tags: Vec::new(),
            cache_ttl_ms: None,
            metadata: HashMap::new(),
        }
    }
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_cache_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.cache_ttl_ms = Some(ttl_ms);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Concatenated prompt text: system prompt followed by every message.
    pub fn content(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(self.messages.len() + 1);
        if let Some(system) = &self.system {
            parts.push(system);
        }
        parts.extend(self.messages.iter().map(|m| m.content.as_str()));
        parts.join("\n")
    }

    /// Rough input token estimate (chars / 4).
    pub fn estimated_tokens(&self) -> u64 {
        let chars: usize = self.system.as_ref().map_or(0, |s| s.len())
            + self.messages.iter().map(|m| m.content.len()).sum::<usize>();
        let prompt = (chars as u64).div_ceil(4);
        prompt + u64::from(self.max_tokens.unwrap_or(0))
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Scale usage by `fraction`, rounding to the nearest token.
    pub fn scaled(&self, fraction: f64) -> Self {
        Self {
            input_tokens: (self.input_tokens as f64 * fraction).round() as u64,
            output_tokens: (self.output_tokens as f64 * fraction).round() as u64,
        }
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
}

/// Completion response returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Id of the request this answers
    pub id: String,
    /// Model used
    pub model: String,
    /// Provider that served the request
    pub provider: String,
    /// Generated content
    pub content: String,
    /// Stop reason
    pub stop_reason: Option<StopReason>,
    /// Token usage attributed to this request
    pub usage: TokenUsage,
    /// Cost in USD attributed to this request
    pub cost: f64,
    /// Served from the response cache
    pub cached: bool,
    /// Served as part of a combined batch
    pub batched: bool,
    /// Upstream latency in milliseconds (zero for cache hits)
    pub latency_ms: u64,
    /// Response timestamp
    pub timestamp: DateTime<Utc>,
}

impl CompletionResponse {
    pub fn new(
        id: impl Into<String>,
        model: impl Into<String>,
        provider: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            provider: provider.into(),
            content: content.into(),
            stop_reason: Some(StopReason::EndTurn),
            usage: TokenUsage::default(),
            cost: 0.0,
            cached: false,
            batched: false,
            latency_ms: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// Cost tracking per provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostTracker {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    /// Total cost in USD
    pub total_cost: f64,
    pub request_count: u64,
    /// Per-provider breakdown
    pub by_provider: HashMap<String, ProviderCosts>,
}

/// Costs for a specific provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderCosts {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub request_count: u64,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record usage from a completion response.
    pub fn record(&mut self, provider: &str, usage: &TokenUsage, cost: f64) {
        self.total_input_tokens += usage.input_tokens;
        self.total_output_tokens += usage.output_tokens;
        self.total_cost += cost;
        self.request_count += 1;

        let costs = self.by_provider.entry(provider.to_string()).or_default();
        costs.input_tokens += usage.input_tokens;
        costs.output_tokens += usage.output_tokens;
        costs.cost += cost;
        costs.request_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_request_builder() {
        let req = CompletionRequest::new("gpt-4o-mini")
            .with_id("req-1")
            .with_system("You are helpful")
            .with_message(ChatMessage::user("Hi"))
            .with_max_tokens(100)
            .with_temperature(0.7)
            .with_priority(9);

        assert_eq!(req.id, "req-1");
        assert_eq!(req.model, "gpt-4o-mini");
        assert_eq!(req.system.as_deref(), Some("You are helpful"));
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.priority, 9);
        assert_eq!(req.content(), "You are helpful\nHi");
    }

    #[test]
    fn test_estimated_tokens() {
        let req = CompletionRequest::new("m")
            .with_message(ChatMessage::user("a".repeat(40)))
            .with_max_tokens(10);
        // 40 chars / 4 + 10 output
        assert_eq!(req.estimated_tokens(), 20);
    }

    #[test]
    fn test_usage_scaled() {
        let usage = TokenUsage::new(300, 90);
        let third = usage.scaled(1.0 / 3.0);
        assert_eq!(third, TokenUsage::new(100, 30));
    }

    #[test]
    fn test_cost_tracker() {
        let mut tracker = CostTracker::new();
        tracker.record("a", &TokenUsage::new(1000, 500), 0.01);
        tracker.record("a", &TokenUsage::new(2000, 1000), 0.02);
        tracker.record("b", &TokenUsage::new(10, 5), 0.001);

        assert_eq!(tracker.total_input_tokens, 3010);
        assert_eq!(tracker.request_count, 3);
        assert!((tracker.total_cost - 0.031).abs() < 1e-9);
        assert_eq!(tracker.by_provider["a"].request_count, 2);
    }
}
