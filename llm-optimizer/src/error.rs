//! Error types for llm-optimizer.

use thiserror::Error;

/// Result type alias using llm-optimizer's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while optimizing requests.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Malformed configuration or request parameters
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// The injected provider executor failed or timed out
    #[error("Provider execution error: {provider} - {message}")]
    ProviderExecution {
        provider: String,
        message: String,
        timed_out: bool,
    },

    /// Malformed cache snapshot; the live cache was left untouched
    #[error("Cache import error: {0}")]
    CacheImport(String),

    /// A batch completion handle was dropped before it was resolved
    #[error("Batch for key '{batch_key}' was dropped before completion")]
    BatchDropped { batch_key: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Filesystem error during best-effort snapshot export/import
    #[error("I/O error: {0}")]
    Io(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a provider execution error.
    pub fn provider_execution(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderExecution {
            provider: provider.into(),
            message: message.into(),
            timed_out: false,
        }
    }

    /// Create a provider timeout error.
    pub fn provider_timeout(provider: impl Into<String>, duration_ms: u64) -> Self {
        Self::ProviderExecution {
            provider: provider.into(),
            message: format!("timed out after {}ms", duration_ms),
            timed_out: true,
        }
    }

    /// Create a cache import error.
    pub fn cache_import(message: impl Into<String>) -> Self {
        Self::CacheImport(message.into())
    }

    /// Whether the caller may reasonably retry. The optimizer itself never does.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProviderExecution { timed_out: true, .. })
    }
}

// serde_json::Error and io::Error are not Clone; batch failures must be
// cloned to every member, so both are captured as strings.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
