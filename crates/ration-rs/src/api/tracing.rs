//! Correlation ids and cumulative token accounting.
//!
//! Every harness run gets a `trace_id`, every iteration within it a
//! `span_id`, and every message a process-unique `msg-` id.

use crate::context::overflow::TokenUsage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

// One counter for every id kind so ids stay unique even when two are
// generated within the same nanosecond.
static COUNTER: AtomicU64 = AtomicU64::new(0);

fn unique_suffix() -> (u128, u64) {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    (ts, COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Generate a unique trace ID for a harness run.
pub fn generate_trace_id() -> String {
    let (ts, count) = unique_suffix();
    format!("tr-{ts:x}-{count:04x}")
}

/// Generate a span ID for an iteration within a run.
pub fn generate_span_id(trace_id: &str, iteration: u32) -> String {
    format!("{trace_id}:i{iteration}")
}

/// Generate a unique message id.
pub fn generate_message_id() -> String {
    let (ts, count) = unique_suffix();
    format!("msg-{ts:x}-{count:04x}")
}

/// Cumulative token usage across the LLM calls of one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UsageTracker {
    pub total_prompt_tokens: u64,
    pub total_cache_read_tokens: u64,
    pub total_output_tokens: u64,
    pub calls: u32,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the usage reported for one call.
    pub fn record(&mut self, usage: &TokenUsage) {
        self.total_prompt_tokens += usage.prompt_tokens;
        self.total_cache_read_tokens += usage.cache_read_tokens;
        self.total_output_tokens += usage.output_tokens;
        self.calls += 1;
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_prompt_tokens + self.total_cache_read_tokens + self.total_output_tokens
    }

    /// Format as a short summary string.
    pub fn summary(&self) -> String {
        format!(
            "tokens: {} prompt + {} cache-read + {} output = {} total over {} call(s)",
            self.total_prompt_tokens,
            self.total_cache_read_tokens,
            self.total_output_tokens,
            self.total_tokens(),
            self.calls,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_unique() {
        let id1 = generate_trace_id();
        let id2 = generate_trace_id();
        assert_ne!(id1, id2);
        assert!(id1.starts_with("tr-"));
    }

    #[test]
    fn span_id_includes_iteration() {
        let trace = "tr-abc123-0000";
        let span = generate_span_id(trace, 3);
        assert!(span.ends_with("i3"));
        assert!(span.starts_with(trace));
    }

    #[test]
    fn message_ids_unique_under_burst() {
        let ids: std::collections::HashSet<String> =
            (0..1000).map(|_| generate_message_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn usage_tracker_accumulates() {
        let mut tracker = UsageTracker::new();
        tracker.record(&TokenUsage::new(1000, 200, 50));
        tracker.record(&TokenUsage::new(2000, 0, 70));
        assert_eq!(tracker.total_prompt_tokens, 3000);
        assert_eq!(tracker.total_cache_read_tokens, 200);
        assert_eq!(tracker.total_output_tokens, 120);
        assert_eq!(tracker.calls, 2);
        assert!(tracker.summary().contains("2 call(s)"));
    }
}
