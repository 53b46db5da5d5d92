//! Events, handlers, and run results for the [`Harness`](super::harness::Harness).
//!
//! The harness and the compaction engine report progress through
//! [`LoopEvent`] variants. Callers implement [`EventHandler`] to observe
//! them for logging, metrics, or UI; nothing in the loop depends on a
//! handler being present.
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use crate::api::tracing::UsageTracker;
use crate::context::compaction::{CompactionPhase, CompactionReport};
use crate::context::overflow::TokenUsage;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

// ── Events ─────────────────────────────────────────────────────────

/// Events emitted during a run.
#[derive(Debug)]
pub enum LoopEvent<'a> {
    RunStarted {
        trace_id: &'a str,
        session_id: &'a str,
    },
    /// A new iteration is starting.
    IterationStart {
        iteration: u32,
        max_iterations: u32,
        /// Projected prompt-side usage before any compaction.
        projected_tokens: u64,
    },
    /// Projected usage exceeds the usable window; a compaction pass follows.
    OverflowDetected {
        usage: &'a TokenUsage,
        available: u64,
    },
    /// The session moved to another compaction phase.
    PhaseChanged { phase: CompactionPhase },
    /// Old tool results were blanked.
    Pruned { count: usize, freed_tokens: u64 },
    /// A range of history was replaced by a summary.
    Summarized {
        replaced: usize,
        tokens_before: u64,
        tokens_after: u64,
    },
    /// Summarization did not apply; history is unchanged.
    SummaryFailed { reason: &'a str },
    /// A compaction pass finished.
    CompactionFinished { report: &'a CompactionReport },
    /// The model returned text (may be alongside tool calls).
    Text(&'a str),
    /// Usage reported by the provider for this call.
    TokenUsage { usage: &'a TokenUsage },
    /// The model requested tool calls this iteration.
    ToolCallsReceived { iteration: u32, count: usize },
    /// One tool call finished. `result` is what enters the transcript.
    ToolResult {
        name: &'a str,
        call_id: &'a str,
        result: &'a str,
        is_error: bool,
    },
    /// A tool output exceeded the truncation ceilings.
    OutputTruncated {
        call_id: &'a str,
        original_bytes: usize,
        spill_handle: Option<&'a str>,
    },
    /// A transient provider failure will be retried.
    RetryScheduled {
        attempt: u32,
        max_retries: u32,
        delay: Duration,
        error: &'a str,
    },
    /// The model answered without tool calls.
    Finished { iterations: u32 },
    /// The iteration ceiling was reached without a final answer.
    MaxIterationsReached { max_iterations: u32 },
}

/// Handler for loop events.
///
/// # Example
///
/// ```ignore
/// struct MyHandler;
///
/// impl EventHandler for MyHandler {
///     fn on_event(&self, event: &LoopEvent<'_>) {
///         if let LoopEvent::ToolResult { name, result, .. } = event {
///             println!("[{name}] {} bytes", result.len());
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &LoopEvent<'_>) {
        let _ = event;
    }
}

/// A handler that ignores every event.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let LoopEvent::Text(text) = event {
///         println!("{text}");
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&LoopEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&LoopEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&LoopEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &LoopEvent<'_>) {
        (self.0)(event)
    }
}

/// An event handler that delegates to multiple inner handlers, in
/// registration order.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with_if(verbose, DebugHandler::new())
///     .with_opt(metrics.map(MetricsHandler::new));
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a handler to the chain.
    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Conditionally add a handler to the chain.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }

    /// Add a handler from an `Option`. `None` is a no-op.
    pub fn with_opt(self, handler: Option<impl EventHandler + 'static>) -> Self {
        match handler {
            Some(h) => self.with(h),
            None => self,
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &LoopEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// An event handler that logs events via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &LoopEvent<'_>) {
        match event {
            LoopEvent::RunStarted {
                trace_id,
                session_id,
            } => {
                info!("Run {trace_id} started on session {session_id}");
            }
            LoopEvent::IterationStart {
                iteration,
                max_iterations,
                projected_tokens,
            } => {
                info!("[iteration {iteration}/{max_iterations}] ~{projected_tokens} tokens");
            }
            LoopEvent::OverflowDetected { usage, available } => {
                warn!(
                    "Context overflow: {} tokens projected, {available} available",
                    usage.total()
                );
            }
            LoopEvent::PhaseChanged { phase } => {
                debug!("Compaction phase: {phase}");
            }
            LoopEvent::Pruned {
                count,
                freed_tokens,
            } => {
                info!("Pruned {count} tool result(s), freed ~{freed_tokens} tokens");
            }
            LoopEvent::Summarized {
                replaced,
                tokens_before,
                tokens_after,
            } => {
                info!(
                    "Summarized {replaced} message(s): ~{tokens_before} -> ~{tokens_after} tokens"
                );
            }
            LoopEvent::SummaryFailed { reason } => {
                warn!("Summarization skipped: {reason}");
            }
            LoopEvent::CompactionFinished { report } => {
                debug!("{}", report.to_log_string());
            }
            LoopEvent::Text(text) => {
                let preview: String = text.chars().take(200).collect();
                debug!(
                    "LLM text: {preview}{}",
                    if text.len() > 200 { "..." } else { "" }
                );
            }
            LoopEvent::TokenUsage { usage } => {
                debug!(
                    "Tokens: prompt={}, cache_read={}, output={}",
                    usage.prompt_tokens, usage.cache_read_tokens, usage.output_tokens
                );
            }
            LoopEvent::ToolCallsReceived { iteration, count } => {
                debug!("{count} tool call(s) in iteration {iteration}");
            }
            LoopEvent::ToolResult {
                name,
                call_id,
                result,
                is_error,
            } => {
                if *is_error {
                    warn!("Tool {name} ({call_id}) failed: {result}");
                } else {
                    debug!("Tool {name} ({call_id}) result: {} bytes", result.len());
                    let preview: String = result.chars().take(80).collect();
                    trace!("Tool {name} output: {preview}");
                }
            }
            LoopEvent::OutputTruncated {
                call_id,
                original_bytes,
                spill_handle,
            } => {
                debug!(
                    "Truncated output of {call_id} ({original_bytes} bytes), spill: {}",
                    spill_handle.unwrap_or("none")
                );
            }
            LoopEvent::RetryScheduled {
                attempt,
                max_retries,
                delay,
                error,
            } => {
                warn!("LLM call failed ({error}); retry {attempt}/{max_retries} in {delay:?}");
            }
            LoopEvent::Finished { iterations } => {
                info!("Run finished after {iterations} iteration(s)");
            }
            LoopEvent::MaxIterationsReached { max_iterations } => {
                warn!("Run hit the iteration ceiling ({max_iterations})");
            }
        }
    }
}

// ── Run result ─────────────────────────────────────────────────────

/// The result of a successful [`Harness::run()`](super::harness::Harness::run).
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Unique trace ID for this run.
    pub trace_id: String,
    pub session_id: String,
    /// The model's final answer.
    pub final_text: String,
    /// Iterations executed, including the final one.
    pub iterations: u32,
    /// Provider-reported usage totals.
    pub usage: UsageTracker,
    /// Every compaction pass run during this run, in order.
    pub compactions: Vec<CompactionReport>,
    /// Tool calls dispatched across all iterations.
    pub tool_calls: usize,
}

impl RunOutcome {
    /// Total provider-reported tokens.
    pub fn total_tokens(&self) -> u64 {
        self.usage.total_tokens()
    }

    /// Whether any pass replaced history with a summary.
    pub fn summarized(&self) -> bool {
        self.compactions.iter().any(|r| r.summary.is_applied())
    }
}
