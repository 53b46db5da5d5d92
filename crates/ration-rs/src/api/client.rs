//! The narrow contract between the harness and a model provider.
//!
//! Wire format, transport and auth live behind [`LlmClient`]. The harness
//! only needs a request with the (possibly compacted) history and tool
//! schemas, and a response with text, tool calls and reported usage.

use crate::context::overflow::TokenUsage;
use crate::{Message, ToolCall, ToolDef};
use std::future::Future;
use std::pin::Pin;

/// One model call.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// `None` when no tools are registered.
    pub tools: Option<Vec<ToolDef>>,
}

/// What the model produced for one call.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
}

impl LlmResponse {
    /// A text-only (final answer) response.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    /// A response requesting tool calls.
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Default::default()
        }
    }

    /// Attach reported usage (builder pattern).
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Boxed future returned by [`LlmClient::generate`].
pub type GenerateFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<LlmResponse>, String>> + Send + 'a>>;

/// A model provider.
///
/// `Ok(None)` and `Err(_)` are both hard failures for that call; the harness
/// does not retry unless [`RetryConfig`](crate::api::retry::RetryConfig)
/// enables it.
pub trait LlmClient: Send + Sync {
    fn generate<'a>(&'a self, request: &'a GenerateRequest) -> GenerateFuture<'a>;
}
