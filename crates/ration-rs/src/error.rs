//! Error types.
//!
//! Only an invalid config, provider failures, cancellation and the iteration
//! ceiling end a run with a [`LoopError`]. Tool failures are converted into
//! ordinary tool result messages, and summarization failures leave history
//! untouched.

use std::time::Duration;

/// Why a [`Harness`](crate::agent::harness::Harness) run failed.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("LLM provider error: {0}")]
    Provider(String),

    #[error("LLM returned no response")]
    EmptyResponse,

    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),

    #[error(
        "possible infinite loop: reached {max_iterations} iterations without a final answer"
    )]
    MaxIterations { max_iterations: u32 },

    #[error("run cancelled")]
    Cancelled,

    #[error("session '{0}' is busy")]
    SessionBusy(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl LoopError {
    /// Whether a retry of the same request could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LoopError::Provider(e) => {
                crate::api::retry::classify(e) == crate::api::retry::FailureClass::Transient
            }
            LoopError::EmptyResponse | LoopError::Timeout(_) => true,
            _ => false,
        }
    }
}

/// A single tool call's failure. Always isolated to that call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid arguments for tool '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("{0}")]
    Failed(String),

    #[error("tool '{0}' panicked")]
    Panicked(String),

    #[error("tool '{tool}' timed out after {after:?}")]
    Timeout { tool: String, after: Duration },

    #[error("cancelled")]
    Cancelled,
}

/// Message store and persistence failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to (de)serialize session data: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("tool result '{0}' does not answer a tool call issued in the same turn")]
    OrphanToolResult(String),

    #[error("{0}")]
    Backend(String),
}

/// Configuration loading and validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_iterations_message_mentions_infinite_loop() {
        let err = LoopError::MaxIterations { max_iterations: 5 };
        assert!(err.to_string().contains("possible infinite loop"));
    }

    #[test]
    fn transient_classification() {
        assert!(LoopError::Provider("HTTP 503: unavailable".into()).is_transient());
        assert!(!LoopError::Provider("HTTP 401: unauthorized".into()).is_transient());
        assert!(LoopError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!LoopError::Cancelled.is_transient());
        assert!(!LoopError::MaxIterations { max_iterations: 1 }.is_transient());
    }
}
