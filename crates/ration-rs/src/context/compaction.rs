//! The compaction pass: truncate, then prune, then summarize.
//!
//! A pass moves the session through [`CompactionPhase`]s in order and never
//! revisits one:
//!
//! ```text
//! Idle → Truncating → Pruning → Summarizing → Idle
//! ```
//!
//! Truncation normally happens when a tool result is recorded; the
//! `Truncating` phase only catches up on results that bypassed it. Pruning
//! is a pure in-place rewrite. Summarization is the only phase that awaits
//! an external call, and it runs only when the projected usage still
//! overflows after the cheaper tiers (or on a manual request).
//!
//! Every mutation goes through one [`SessionLease::write`] call, so readers
//! see either the old or the new transcript. No lock is held while the
//! summarizer runs; the lease keeps the session logically busy instead.

use crate::Message;
use crate::agent::events::{EventHandler, LoopEvent, NoopHandler};
use crate::agent::session::SessionLease;
use crate::context::overflow::{OverflowDetector, TokenUsage};
use crate::context::prune::PruneConfig;
use crate::context::summarizer::{Summarizer, render_transcript};
use crate::context::tokens;
use crate::context::truncate::Truncator;
use crate::{MessageKind, MessageRole};
use serde::Serialize;
use std::ops::Range;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where a session is within a compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionPhase {
    #[default]
    Idle,
    Truncating,
    Pruning,
    Summarizing,
}

impl std::fmt::Display for CompactionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CompactionPhase::Idle => "idle",
            CompactionPhase::Truncating => "truncating",
            CompactionPhase::Pruning => "pruning",
            CompactionPhase::Summarizing => "summarizing",
        };
        f.write_str(name)
    }
}

/// What started a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionTrigger {
    /// Projected usage exceeded the usable window.
    Overflow,
    /// An explicit request; summarizes regardless of overflow.
    Manual,
}

/// Result of the summarization tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum SummaryOutcome {
    /// The cheaper tiers were enough.
    #[default]
    NotNeeded,
    /// Everything outside the protected tail is already summarized.
    NothingToSummarize,
    Applied {
        replaced: usize,
        tokens_before: u64,
        tokens_after: u64,
    },
    /// The summary was no smaller than what it would replace.
    Rejected { tokens_before: u64, tokens_after: u64 },
    Failed { reason: String },
    Cancelled,
}

impl SummaryOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, SummaryOutcome::Applied { .. })
    }

    /// Estimated tokens removed from the transcript.
    pub fn freed_tokens(&self) -> u64 {
        match self {
            SummaryOutcome::Applied {
                tokens_before,
                tokens_after,
                ..
            } => tokens_before.saturating_sub(*tokens_after),
            _ => 0,
        }
    }
}

/// Returned from every compaction pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    pub trigger: CompactionTrigger,
    /// Phases entered, in order.
    pub phases: Vec<CompactionPhase>,
    /// Tool results truncated by the catch-up phase.
    pub truncated: usize,
    pub truncated_tokens: u64,
    pub pruned_count: usize,
    pub pruned_tokens: u64,
    pub summary: SummaryOutcome,
    /// Usage projected after the pass.
    pub projected: TokenUsage,
    pub overflow_after: bool,
}

impl CompactionReport {
    fn new(trigger: CompactionTrigger, usage: TokenUsage) -> Self {
        Self {
            trigger,
            phases: Vec::new(),
            truncated: 0,
            truncated_tokens: 0,
            pruned_count: 0,
            pruned_tokens: 0,
            summary: SummaryOutcome::NotNeeded,
            projected: usage,
            overflow_after: false,
        }
    }

    /// Total estimated tokens freed by all tiers.
    pub fn freed_tokens(&self) -> u64 {
        self.truncated_tokens + self.pruned_tokens + self.summary.freed_tokens()
    }

    /// One-line description for logs.
    pub fn to_log_string(&self) -> String {
        format!(
            "{:?} pass: truncated={}, pruned={} ({}t), summary={}, freed={}t, overflow_after={}",
            self.trigger,
            self.truncated,
            self.pruned_count,
            self.pruned_tokens,
            match &self.summary {
                SummaryOutcome::NotNeeded => "not needed".to_string(),
                SummaryOutcome::NothingToSummarize => "nothing to summarize".to_string(),
                SummaryOutcome::Applied { replaced, .. } => format!("replaced {replaced}"),
                SummaryOutcome::Rejected { .. } => "rejected".to_string(),
                SummaryOutcome::Failed { reason } => format!("failed ({reason})"),
                SummaryOutcome::Cancelled => "cancelled".to_string(),
            },
            self.freed_tokens(),
            self.overflow_after,
        )
    }
}

// ── Summary planning ───────────────────────────────────────────────

/// The range a summarization would replace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryPlan {
    pub range: Range<usize>,
    /// Every id in `range` when planned.
    pub span_ids: Vec<String>,
    /// Ids the summary replaces. System messages in `range` are kept.
    pub replaced_ids: Vec<String>,
    pub previous_summary: Option<String>,
    /// Rendered transcript of the messages after the previous summary.
    pub text_block: String,
    pub tokens_before: u64,
}

/// Index of the user message opening the oldest of the last
/// `recent_turns` turns. The current turn is always part of the tail.
pub fn tail_start(messages: &[Message], recent_turns: u32) -> usize {
    let keep = recent_turns.max(1) as usize;
    let openers: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.opens_turn())
        .map(|(i, _)| i)
        .collect();
    if openers.len() < keep {
        return openers.first().copied().unwrap_or(0);
    }
    openers[openers.len() - keep]
}

/// Non-summary system messages are never folded into a summary.
pub(crate) fn is_plain_system(message: &Message) -> bool {
    message.role == MessageRole::System && message.kind == MessageKind::Text
}

/// Plan a summarization pass. `None` when nothing new lies between the last
/// summary boundary and the protected tail.
pub fn plan_summary(messages: &[Message], recent_turns: u32) -> Option<SummaryPlan> {
    let start = match messages.iter().rposition(Message::is_summary) {
        Some(index) => index,
        None => messages
            .iter()
            .position(|m| !is_plain_system(m))
            .unwrap_or(messages.len()),
    };
    let end = tail_start(messages, recent_turns).max(start);
    let range = start..end;
    let span = messages.get(range.clone())?;

    let (previous_summary, rest) = match span.split_first() {
        Some((first, rest)) if first.is_summary() => (Some(first.content.clone()), rest),
        _ => (None, span),
    };
    let fresh: Vec<Message> = rest.iter().filter(|m| !is_plain_system(m)).cloned().collect();
    if fresh.is_empty() {
        return None;
    }
    let replaced: Vec<&Message> = span.iter().filter(|m| !is_plain_system(m)).collect();

    Some(SummaryPlan {
        span_ids: span.iter().map(|m| m.id.clone()).collect(),
        replaced_ids: replaced.iter().map(|m| m.id.clone()).collect(),
        previous_summary,
        text_block: render_transcript(&fresh),
        tokens_before: replaced.iter().map(|m| tokens::estimate_message(m)).sum(),
        range,
    })
}

// ── Engine ─────────────────────────────────────────────────────────

/// Runs compaction passes against a leased session.
pub struct CompactionEngine<'a> {
    detector: OverflowDetector,
    prune: PruneConfig,
    truncator: Truncator,
    summarizer: Option<&'a dyn Summarizer>,
    summary_timeout: Duration,
    cancel: CancellationToken,
    event_handler: &'a dyn EventHandler,
}

impl<'a> CompactionEngine<'a> {
    pub fn new(detector: OverflowDetector, prune: PruneConfig) -> Self {
        Self {
            detector,
            prune,
            truncator: Truncator::default(),
            summarizer: None,
            summary_timeout: Duration::from_secs(300),
            cancel: CancellationToken::new(),
            event_handler: &NoopHandler,
        }
    }

    pub fn with_truncator(mut self, truncator: Truncator) -> Self {
        self.truncator = truncator;
        self
    }

    /// Enable tier 3. Without a summarizer the pass stops after pruning.
    pub fn with_summarizer(mut self, summarizer: &'a dyn Summarizer) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_summary_timeout(mut self, timeout: Duration) -> Self {
        self.summary_timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_event_handler(mut self, handler: &'a dyn EventHandler) -> Self {
        self.event_handler = handler;
        self
    }

    pub fn detector(&self) -> &OverflowDetector {
        &self.detector
    }

    fn enter(&self, lease: &SessionLease, report: &mut CompactionReport, phase: CompactionPhase) {
        lease.write(|s| s.set_phase(phase));
        if phase != CompactionPhase::Idle {
            report.phases.push(phase);
        }
        self.event_handler
            .on_event(&LoopEvent::PhaseChanged { phase });
    }

    /// Run one pass. `usage` is the projected usage that prompted it.
    pub async fn run(
        &self,
        lease: &SessionLease,
        usage: TokenUsage,
        trigger: CompactionTrigger,
    ) -> CompactionReport {
        let session_id = lease.handle().id().to_string();
        info!(
            "Compaction started for session {session_id} ({trigger:?}, {} projected tokens)",
            usage.total()
        );
        let mut report = CompactionReport::new(trigger, usage);

        self.enter(lease, &mut report, CompactionPhase::Truncating);
        let (truncated, truncated_tokens) = lease.write(|s| s.truncate_oversized(&self.truncator));
        report.truncated = truncated;
        report.truncated_tokens = truncated_tokens;

        if self.prune.enabled {
            self.enter(lease, &mut report, CompactionPhase::Pruning);
            let outcome = lease.write(|s| s.prune(&self.prune));
            report.pruned_count = outcome.pruned_count;
            report.pruned_tokens = outcome.freed_tokens;
            if outcome.pruned_count > 0 {
                self.event_handler.on_event(&LoopEvent::Pruned {
                    count: outcome.pruned_count,
                    freed_tokens: outcome.freed_tokens,
                });
            }
        }

        let mut projected = usage.minus_prompt(truncated_tokens + report.pruned_tokens);
        if trigger == CompactionTrigger::Manual || self.detector.is_overflow(&projected) {
            self.enter(lease, &mut report, CompactionPhase::Summarizing);
            report.summary = self.summarize(lease).await;
            projected = projected.minus_prompt(report.summary.freed_tokens());
        }

        report.projected = projected;
        report.overflow_after = self.detector.is_overflow(&projected);
        self.enter(lease, &mut report, CompactionPhase::Idle);
        info!("Compaction finished for session {session_id}: {}", report.to_log_string());
        report
    }

    async fn summarize(&self, lease: &SessionLease) -> SummaryOutcome {
        let recent = self.prune.recent_turns_protected;
        let Some(plan) = lease.read(|s| plan_summary(s.messages(), recent)) else {
            debug!("Nothing to summarize outside the protected tail");
            return SummaryOutcome::NothingToSummarize;
        };
        let Some(summarizer) = self.summarizer else {
            return self.fail("no summarizer configured".to_string());
        };

        debug!(
            "Summarizing {} message(s), ~{} tokens",
            plan.replaced_ids.len(),
            plan.tokens_before
        );
        let call = summarizer.summarize(&plan.text_block, plan.previous_summary.as_deref());
        let text = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                warn!("Summarization cancelled; session left unchanged");
                return SummaryOutcome::Cancelled;
            }
            result = tokio::time::timeout(self.summary_timeout, call) => match result {
                Ok(Ok(text)) if !text.trim().is_empty() => text,
                Ok(Ok(_)) => return self.fail("summarizer returned empty text".to_string()),
                Ok(Err(e)) => return self.fail(e),
                Err(_) => {
                    return self.fail(format!("summarizer timed out after {:?}", self.summary_timeout));
                }
            },
        };

        let summary = Message::summary(text, plan.replaced_ids.clone());
        let tokens_after = tokens::estimate_message(&summary);
        if tokens_after >= plan.tokens_before {
            warn!(
                "Rejected summary: {tokens_after} tokens would replace {} tokens",
                plan.tokens_before
            );
            return SummaryOutcome::Rejected {
                tokens_before: plan.tokens_before,
                tokens_after,
            };
        }

        let replaced = lease.write(|s| {
            let unchanged = s
                .messages()
                .get(plan.range.clone())
                .is_some_and(|span| span.iter().map(|m| &m.id).eq(plan.span_ids.iter()));
            unchanged.then(|| s.replace_range(plan.range.clone(), summary).len())
        });
        let Some(replaced) = replaced else {
            return self.fail("session changed during summarization".to_string());
        };

        self.event_handler.on_event(&LoopEvent::Summarized {
            replaced,
            tokens_before: plan.tokens_before,
            tokens_after,
        });
        SummaryOutcome::Applied {
            replaced,
            tokens_before: plan.tokens_before,
            tokens_after,
        }
    }

    fn fail(&self, reason: String) -> SummaryOutcome {
        warn!("Summarization failed, history left unchanged: {reason}");
        self.event_handler
            .on_event(&LoopEvent::SummaryFailed { reason: &reason });
        SummaryOutcome::Failed { reason }
    }
}
