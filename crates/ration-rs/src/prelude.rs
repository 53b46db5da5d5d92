//! Convenience re-exports for common `ration-rs` types.
//!
//! Meant to be glob-imported when wiring a loop:
//!
//! ```ignore
//! use ration_rs::prelude::*;
//! ```
//!
//! Specialized types (prune plans, summary plans, spill stores, retry
//! classification) are left out; import those from their modules directly.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{Message, MessageKind, MessageRole, ToolCall, ToolDef, json_schema_for};

// ── Model boundary ──────────────────────────────────────────────────
pub use crate::api::{GenerateFuture, GenerateRequest, LlmClient, LlmResponse};

// ── Agent runtime ───────────────────────────────────────────────────
pub use crate::agent::{
    CompositeEventHandler, EventHandler, FnEventHandler, Harness, HarnessConfig, LoggingHandler,
    LoopEvent, MessageStore, NoopHandler, RunOutcome, SessionHandle,
};

// ── Context management ──────────────────────────────────────────────
pub use crate::context::{CompactionReport, TokenUsage};

// ── Errors ──────────────────────────────────────────────────────────
pub use crate::error::{LoopError, ToolError};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::{FnTool, Tool, ToolFuture, ToolRegistry, parse_tool_args};
