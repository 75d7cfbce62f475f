//! Request/response model and the provider executor seam.
//!
//! ## Example
//!
//! ```rust,ignore
//! use llm_optimizer::llm::{ChatMessage, CompletionRequest};
//!
//! let request = CompletionRequest::new("gpt-4o-mini")
//!     .with_system("You are terse")
//!     .with_message(ChatMessage::user("Summarize the design"))
//!     .with_temperature(0.2);
//! ```

mod executor;
mod types;

#[cfg(test)]
pub(crate) use executor::mock;
pub use executor::{ProviderExecutor, TrackedExecutor};
pub use types::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, CostTracker, ProviderCosts,
    StopReason, TokenUsage,
};
