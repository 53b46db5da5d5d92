//! Context-budget orchestration for tool-using LLM loops.
//!
//! `ration-rs` drives a language model through a bounded, multi-turn tool-use
//! loop while keeping the conversation inside the model's fixed context
//! window. The core abstraction is the [`Harness`](agent::harness::Harness):
//! it calls the model, dispatches any requested tool calls concurrently,
//! appends their (bounded) results, and repeats until the model answers in
//! plain text or the iteration ceiling is reached.
//!
//! Before every model call the harness asks the
//! [`OverflowDetector`](context::overflow::OverflowDetector) whether the
//! projected usage still fits. When it does not, the
//! [`CompactionEngine`](context::compaction::CompactionEngine) runs a pass
//! over the session:
//!
//! 1. **Truncate**: oversized tool output becomes a bounded preview plus a
//!    handle to the full payload ([`context::truncate`]). Applied as results
//!    are created.
//! 2. **Prune**: old tool output outside the protected recent turns is
//!    blanked, newest first, once a token budget is exceeded
//!    ([`context::prune`]).
//! 3. **Summarize**: when pruning is not enough, the span between the last
//!    summary boundary and the protected tail is condensed into one summary
//!    message by an external [`Summarizer`](context::summarizer::Summarizer).
//!
//! # Getting started
//!
//! ```ignore
//! use ration_rs::prelude::*;
//!
//! let tools = ToolRegistry::new().with(my_tool);
//! let config = HarnessConfig::new("my-model").with_system_prompt("You are helpful.");
//! let store = MessageStore::new();
//! let session = store.open("session-1", "user-1")?;
//!
//! let outcome = Harness::new(&client, &tools, config)
//!     .with_event_handler(&LoggingHandler)
//!     .with_store(&store)
//!     .run(&session, "Summarize the build logs.")
//!     .await?;
//!
//! println!("{}", outcome.final_text);
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`agent`] | [`Harness`](agent::harness::Harness) loop, config, events, sessions, persistence |
//! | [`context`] | Token estimation, overflow detection, truncation, pruning, summarization, compaction |
//! | [`tools`] | [`Tool`](tools::core::Tool) trait, [`ToolRegistry`](tools::core::ToolRegistry), concurrent dispatch |
//! | [`api`] | [`LlmClient`](api::client::LlmClient) contract, retry with backoff, ids |

pub mod agent;
pub mod api;
pub mod context;
pub mod error;
pub mod prelude;
pub mod tools;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use error::{ConfigError, LoopError, StoreError, ToolError};

// Re-export schemars for downstream crates.
pub use schemars;

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`. Tools publish their parameter schema this way.
///
/// # Example
///
/// ```
/// use ration_rs::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct GrepArgs {
///     pattern: String,
///     #[serde(default)]
///     path: Option<String>,
/// }
///
/// let schema = json_schema_for::<GrepArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"pattern".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// What a message carries, independent of who sent it.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    ToolCall,
    ToolResult,
    /// A compaction boundary. History before it is never rewritten.
    Summary,
}

/// A tool call requested by the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments as produced by the model. May be malformed.
    pub arguments: String,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// A message in a session.
///
/// Messages are append-only apart from two compaction mutations: a tool
/// result's content may be blanked by pruning, and a contiguous range may be
/// replaced by a single [`MessageKind::Summary`] message.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Name of the tool that produced a tool result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Turn this message belongs to. Messages without one are never pruned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_index: Option<u32>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted_at: Option<DateTime<Utc>>,
    /// Ids of the messages a summary replaced.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub summarized_ids: Vec<String>,
}

impl Message {
    fn base(role: MessageRole, kind: MessageKind, content: String) -> Self {
        Self {
            id: api::tracing::generate_message_id(),
            role,
            kind,
            content,
            tool_call_id: None,
            tool_calls: Vec::new(),
            tool_name: None,
            turn_index: None,
            created_at: Utc::now(),
            compacted_at: None,
            summarized_ids: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::base(MessageRole::System, MessageKind::Text, content.into())
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::base(MessageRole::User, MessageKind::Text, content.into())
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::base(MessageRole::Assistant, MessageKind::Text, content.into())
    }

    /// An assistant message carrying tool calls, with any text the model
    /// produced alongside them.
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::base(MessageRole::Assistant, MessageKind::ToolCall, content.into());
        msg.tool_calls = calls;
        msg
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::base(MessageRole::Tool, MessageKind::ToolResult, content.into());
        msg.tool_call_id = Some(call_id.into());
        msg.tool_name = Some(tool_name.into());
        msg
    }

    /// A summary boundary replacing the messages with the given ids.
    pub fn summary(content: impl Into<String>, summarized_ids: Vec<String>) -> Self {
        let mut msg = Self::base(MessageRole::System, MessageKind::Summary, content.into());
        msg.summarized_ids = summarized_ids;
        msg
    }

    /// Assign the message to a turn (builder pattern).
    pub fn at_turn(mut self, turn: u32) -> Self {
        self.turn_index = Some(turn);
        self
    }

    pub fn is_summary(&self) -> bool {
        self.kind == MessageKind::Summary
    }

    pub fn is_tool_result(&self) -> bool {
        self.kind == MessageKind::ToolResult
    }

    /// Whether pruning has already blanked this message.
    pub fn is_compacted(&self) -> bool {
        self.compacted_at.is_some()
    }

    /// Whether this is the user message that opens a turn.
    pub fn opens_turn(&self) -> bool {
        self.role == MessageRole::User && self.kind == MessageKind::Text
    }
}

// ── Tool definitions ───────────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition handed to the model (function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    /// Create a function-calling tool definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_unique() {
        let a = Message::user("one");
        let b = Message::user("one");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn constructors_set_kinds() {
        assert_eq!(Message::user("q").kind, MessageKind::Text);
        assert!(Message::user("q").opens_turn());
        assert!(!Message::system("s").opens_turn());

        let call = Message::assistant_tool_calls("", vec![ToolCall::new("c1", "grep", "{}")]);
        assert_eq!(call.kind, MessageKind::ToolCall);
        assert_eq!(call.tool_calls.len(), 1);

        let result = Message::tool_result("c1", "grep", "match").at_turn(3);
        assert!(result.is_tool_result());
        assert_eq!(result.turn_index, Some(3));
        assert_eq!(result.tool_name.as_deref(), Some("grep"));

        let summary = Message::summary("so far", vec!["m1".into()]);
        assert!(summary.is_summary());
        assert_eq!(summary.role, MessageRole::System);
    }

    #[test]
    fn message_serde_skips_empty_fields() {
        let msg = Message::user("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["kind"], "text");
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("summarized_ids").is_none());

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, msg.id);
        assert_eq!(back.content, "hello");
    }
}
