//! Model provider boundary, retry, and correlation ids.
//!
//! - [`client`]: the [`LlmClient`] trait and its request/response types.
//!   Concrete wire clients implement it outside this crate.
//! - [`retry`]: transient error detection (429, 5xx, network timeouts) with
//!   configurable exponential backoff. Disabled by default.
//! - [`tracing`]: `trace_id` / `span_id` / message ids and the per-run
//!   [`UsageTracker`].

pub mod client;
pub mod retry;
pub mod tracing;

// Re-export commonly used items at the module level.
pub use client::{GenerateFuture, GenerateRequest, LlmClient, LlmResponse};
pub use retry::RetryConfig;
pub use tracing::{UsageTracker, generate_message_id, generate_span_id, generate_trace_id};
