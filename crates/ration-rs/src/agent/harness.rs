//! The orchestration loop: a bounded tool-use loop with context-budget
//! compaction.
//!
//! The [`Harness`] sends the session's history plus tool definitions to the
//! model, dispatches any returned tool calls through the [`ToolRegistry`],
//! appends the results, and repeats until the model answers without tool
//! calls or the iteration ceiling is reached. Before every call it projects
//! prompt usage and runs a compaction pass when the overflow detector says
//! so. Callers observe the loop via [`EventHandler`] events.

use super::config::HarnessConfig;
use super::events::{EventHandler, LoopEvent, NoopHandler, RunOutcome};
use super::execution::{record_tool_results, retry_api_call, send_request};
use super::session::{MessageStore, SessionHandle, SessionLease};
use crate::{Message, ToolCall};
use crate::api::client::{GenerateRequest, LlmClient};
use crate::api::tracing::{UsageTracker, generate_span_id, generate_trace_id};
use crate::context::compaction::{
    CompactionEngine, CompactionReport, CompactionTrigger, SummaryOutcome,
};
use crate::context::overflow::TokenUsage;
use crate::context::summarizer::{LlmSummarizer, Summarizer};
use crate::context::tokens;
use crate::context::truncate::{SpillStore, Truncator};
use crate::error::LoopError;
use crate::tools::core::ToolRegistry;
use crate::tools::dispatch::Dispatcher;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ── Harness ────────────────────────────────────────────────────────

/// The orchestration loop.
///
/// ```ignore
/// let tools = ToolRegistry::new().with(MyTool);
/// let config = HarnessConfig::new("my-model").with_system_prompt("...");
/// let store = MessageStore::new();
/// let session = store.open("session-1", "user-1")?;
///
/// let outcome = Harness::new(&client, &tools, config)
///     .with_store(&store)
///     .run(&session, "What changed?")
///     .await?;
///
/// println!("{}", outcome.final_text);
/// ```
///
/// # Lifetimes
///
/// `Harness<'a>` borrows the client, tools, summarizer, event handler and
/// store. Bind them to `let` bindings *before* building the harness:
///
/// ```ignore
/// // Correct: handler lives long enough.
/// let handler = CompositeEventHandler::new().with(LoggingHandler);
/// let harness = Harness::new(&client, &tools, config).with_event_handler(&handler);
///
/// // Wrong: temporary dropped before .run():
/// // let harness = Harness::new(&client, &tools, config)
/// //     .with_event_handler(&CompositeEventHandler::new().with(LoggingHandler));
/// ```
pub struct Harness<'a> {
    client: &'a dyn LlmClient,
    tools: &'a ToolRegistry,
    config: HarnessConfig,
    /// Falls back to an [`LlmSummarizer`] over `client`.
    summarizer: Option<&'a dyn Summarizer>,
    event_handler: &'a dyn EventHandler,
    cancel: CancellationToken,
    spill: Option<Arc<dyn SpillStore>>,
    /// Flushed when a run or manual pass ends.
    store: Option<&'a MessageStore>,
}

impl<'a> Harness<'a> {
    pub fn new(client: &'a dyn LlmClient, tools: &'a ToolRegistry, config: HarnessConfig) -> Self {
        Self {
            client,
            tools,
            config,
            summarizer: None,
            event_handler: &NoopHandler,
            cancel: CancellationToken::new(),
            spill: None,
            store: None,
        }
    }

    /// Use a dedicated summarizer instead of the main client.
    pub fn with_summarizer(mut self, summarizer: &'a dyn Summarizer) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Attach an event handler.
    pub fn with_event_handler(mut self, handler: &'a dyn EventHandler) -> Self {
        self.event_handler = handler;
        self
    }

    /// Cancel in-flight model and tool calls when `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Keep full payloads of truncated tool output in `store`.
    pub fn with_spill_store(mut self, store: Arc<dyn SpillStore>) -> Self {
        self.spill = Some(store);
        self
    }

    /// Flush session changes to `store` at the end of each run.
    pub fn with_store(mut self, store: &'a MessageStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run one turn: append `input` as a user message and loop until the
    /// model answers.
    ///
    /// Fails with [`LoopError::Config`] before touching the session when the
    /// config does not validate, and fast with [`LoopError::SessionBusy`]
    /// when another run or pass holds the session. On failure the session
    /// keeps everything appended so far.
    pub async fn run(
        &self,
        session: &SessionHandle,
        input: impl Into<String>,
    ) -> Result<RunOutcome, LoopError> {
        self.config.validate()?;
        let lease = session.try_lease()?;
        let trace_id = generate_trace_id();
        info!(
            "Harness run started: trace_id={trace_id}, session={}, model={}",
            session.id(),
            self.config.model
        );
        self.event_handler.on_event(&LoopEvent::RunStarted {
            trace_id: &trace_id,
            session_id: session.id(),
        });

        let result = self.drive(&lease, &trace_id, input.into()).await;
        self.flush(session, result.is_ok())?;
        result
    }

    /// Run one compaction pass now, regardless of overflow.
    pub async fn compact_now(&self, session: &SessionHandle) -> Result<CompactionReport, LoopError> {
        self.config.validate()?;
        let lease = session.try_lease()?;
        let fallback = self.fallback_summarizer();
        let engine = self.engine(self.summarizer.unwrap_or(&fallback));
        let usage = self.estimate_usage(&lease);
        let report = engine.run(&lease, usage, CompactionTrigger::Manual).await;
        self.event_handler
            .on_event(&LoopEvent::CompactionFinished { report: &report });
        self.flush(session, true)?;
        Ok(report)
    }

    async fn drive(
        &self,
        lease: &SessionLease,
        trace_id: &str,
        input: String,
    ) -> Result<RunOutcome, LoopError> {
        lease.write(|s| {
            s.begin_turn();
            s.append(Message::user(input))
        })?;

        let tool_defs = self.tools.definitions();
        let tools = (!tool_defs.is_empty()).then_some(tool_defs);
        let fallback = self.fallback_summarizer();
        let engine = self.engine(self.summarizer.unwrap_or(&fallback));
        let dispatcher = Dispatcher::new(self.tools)
            .with_timeout(
                self.tools
                    .default_timeout()
                    .unwrap_or_else(|| self.config.tool_timeout()),
            )
            .with_cancellation(self.cancel.clone());
        let truncator = self.truncator();
        let max_iterations = self.config.max_loop_iterations;

        let mut usage = UsageTracker::new();
        let mut compactions = Vec::new();
        let mut tool_call_count = 0;
        // Last provider-reported usage, and tokens appended since.
        let mut last_usage: Option<TokenUsage> = None;
        let mut appended_since = 0;

        for iteration in 1..=max_iterations {
            if self.cancel.is_cancelled() {
                return Err(LoopError::Cancelled);
            }
            let span_id = generate_span_id(trace_id, iteration);
            let projected = match last_usage {
                Some(reported) => reported.plus_prompt(appended_since),
                None => self.estimate_usage(lease),
            };
            debug!("[{span_id}] projected usage {} tokens", projected.total());
            self.event_handler.on_event(&LoopEvent::IterationStart {
                iteration,
                max_iterations,
                projected_tokens: projected.total(),
            });

            if engine.detector().should_compact(&projected) {
                self.event_handler.on_event(&LoopEvent::OverflowDetected {
                    usage: &projected,
                    available: engine.detector().available().unwrap_or_default(),
                });
                let report = engine
                    .run(lease, projected, CompactionTrigger::Overflow)
                    .await;
                self.event_handler
                    .on_event(&LoopEvent::CompactionFinished { report: &report });
                let cancelled = report.summary == SummaryOutcome::Cancelled;
                compactions.push(report);
                if cancelled {
                    return Err(LoopError::Cancelled);
                }
                last_usage = None;
                appended_since = 0;
            }

            let request = GenerateRequest {
                model: self.config.model.clone(),
                system_prompt: self.config.system_prompt.clone(),
                messages: lease.read(|s| s.messages().to_vec()),
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
                tools: tools.clone(),
            };
            let timeout = self.config.llm_timeout();
            let response = retry_api_call(&self.config.retry, self.event_handler, &self.cancel, || {
                send_request(self.client, &request, timeout, &self.cancel)
            })
            .await?;

            match &response.usage {
                Some(reported) => {
                    usage.record(reported);
                    self.event_handler
                        .on_event(&LoopEvent::TokenUsage { usage: reported });
                    last_usage = Some(*reported);
                    appended_since = 0;
                }
                None => last_usage = None,
            }

            let text = response.content.unwrap_or_default();
            if !text.is_empty() {
                self.event_handler.on_event(&LoopEvent::Text(&text));
            }

            if response.tool_calls.is_empty() {
                lease.write(|s| s.append(Message::assistant_text(text.clone())))?;
                self.event_handler
                    .on_event(&LoopEvent::Finished { iterations: iteration });
                info!(
                    "Harness run finished: trace_id={trace_id}, {iteration} iteration(s), {}",
                    usage.summary()
                );
                return Ok(RunOutcome {
                    trace_id: trace_id.to_string(),
                    session_id: lease.handle().id().to_string(),
                    final_text: text,
                    iterations: iteration,
                    usage,
                    compactions,
                    tool_calls: tool_call_count,
                });
            }

            let calls = assign_missing_call_ids(response.tool_calls, &span_id);
            self.event_handler.on_event(&LoopEvent::ToolCallsReceived {
                iteration,
                count: calls.len(),
            });
            tool_call_count += calls.len();
            lease.write(|s| s.append(Message::assistant_tool_calls(text, calls.clone())))?;

            // The batch is persisted only once every call has resolved.
            let results = dispatcher.dispatch(&calls).await;
            appended_since += record_tool_results(lease, results, &truncator, self.event_handler)?;

            if self.cancel.is_cancelled() {
                return Err(LoopError::Cancelled);
            }
        }

        warn!("Harness run {trace_id} reached {max_iterations} iterations without a final answer");
        self.event_handler
            .on_event(&LoopEvent::MaxIterationsReached { max_iterations });
        Err(LoopError::MaxIterations { max_iterations })
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn fallback_summarizer(&self) -> LlmSummarizer<'a> {
        LlmSummarizer::new(
            self.client,
            &self.config.model,
            self.config.compaction.summary.clone(),
        )
    }

    fn engine<'s>(&'s self, summarizer: &'s dyn Summarizer) -> CompactionEngine<'s> {
        CompactionEngine::new(self.config.detector(), self.config.compaction.prune_config())
            .with_truncator(self.truncator())
            .with_summarizer(summarizer)
            .with_summary_timeout(self.config.llm_timeout())
            .with_cancellation(self.cancel.clone())
            .with_event_handler(self.event_handler)
    }

    fn truncator(&self) -> Truncator {
        let truncator = self.config.compaction.truncator();
        match &self.spill {
            Some(store) => truncator.with_spill_store(store.clone()),
            None => truncator,
        }
    }

    /// Estimator-only usage: system prompt plus the active transcript.
    fn estimate_usage(&self, lease: &SessionLease) -> TokenUsage {
        let system = self
            .config
            .system_prompt
            .as_deref()
            .map_or(0, tokens::estimate);
        TokenUsage::estimated(system + lease.read(|s| s.estimated_tokens()))
    }

    /// Flush to the attached store. A flush failure after a failed run is
    /// logged so the run's own error is what the caller sees.
    fn flush(&self, session: &SessionHandle, surface_errors: bool) -> Result<(), LoopError> {
        let Some(store) = self.store else {
            return Ok(());
        };
        match store.flush(session) {
            Ok(written) => {
                debug!("Flushed {written} message(s) for session {}", session.id());
                Ok(())
            }
            Err(e) if surface_errors => Err(e.into()),
            Err(e) => {
                warn!("Failed to flush session {}: {e}", session.id());
                Ok(())
            }
        }
    }
}

/// Give every call a non-empty id so its result can be matched to it.
fn assign_missing_call_ids(mut calls: Vec<ToolCall>, span_id: &str) -> Vec<ToolCall> {
    for (i, call) in calls.iter_mut().enumerate() {
        if call.id.trim().is_empty() {
            call.id = format!("{span_id}-call-{i}");
            debug!("Assigned id {} to unnamed call of '{}'", call.id, call.name);
        }
    }
    calls
}
