//! Tier 2: blank old tool output, newest to oldest, past a token budget.
//!
//! Tool output is the largest context consumer in a tool-use loop, and most
//! of it is irrelevant once the model has acted on it. Pruning keeps message
//! structure intact (the call and its result stay paired) and only replaces
//! the result's content with [`PRUNED_MARKER`]. No model call is needed.
//!
//! The scan walks backwards from the newest message and keeps a running
//! total of tool-output tokens outside the protected window. A result is
//! selected once that total exceeds `protect_token_budget`, so the most
//! recent `protect_token_budget` tokens of old output always survive. The
//! scan stops at the latest summary boundary. The pass applies only if the
//! selected output adds up to at least `min_prune_tokens`.

use crate::Message;
use crate::context::tokens;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Content of a tool result after pruning.
pub const PRUNED_MARKER: &str = "[Old tool result content cleared]";

/// Knobs for the pruning pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneConfig {
    pub enabled: bool,
    /// Turns at the end of the session whose output is never pruned.
    pub recent_turns_protected: u32,
    /// Old tool-output tokens kept before pruning starts.
    pub protect_token_budget: u64,
    /// A pass smaller than this is not worth the cache invalidation.
    pub min_prune_tokens: u64,
    /// Tools whose output is never pruned.
    pub protected_tools: HashSet<String>,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            recent_turns_protected: 2,
            protect_token_budget: 40_000,
            min_prune_tokens: 20_000,
            protected_tools: HashSet::new(),
        }
    }
}

impl PruneConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a protected tool name (its output is never pruned).
    pub fn protect_tool(mut self, name: impl Into<String>) -> Self {
        self.protected_tools.insert(name.into());
        self
    }

    pub fn with_recent_turns(mut self, turns: u32) -> Self {
        self.recent_turns_protected = turns;
        self
    }

    pub fn with_budgets(mut self, protect_token_budget: u64, min_prune_tokens: u64) -> Self {
        self.protect_token_budget = protect_token_budget;
        self.min_prune_tokens = min_prune_tokens;
        self
    }
}

/// Tool results selected by a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrunePlan {
    /// Message indices to blank, newest first.
    pub indices: Vec<usize>,
    /// Estimated tokens of the selected output.
    pub prunable_tokens: u64,
    /// Estimated tokens of all unprotected output seen by the scan.
    pub scanned_tokens: u64,
}

impl PrunePlan {
    /// Whether applying this plan clears the configured minimum.
    pub fn worth_applying(&self, config: &PruneConfig) -> bool {
        !self.indices.is_empty() && self.prunable_tokens >= config.min_prune_tokens
    }
}

/// What a pruning pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneOutcome {
    pub pruned_count: usize,
    /// Estimated tokens removed from the transcript.
    pub freed_tokens: u64,
}

fn is_protected_turn(turn_index: u32, current_turn: u32, recent: u32) -> bool {
    current_turn.saturating_sub(turn_index) < recent
}

/// Resolve tool names through the assistant messages that issued the calls.
fn tool_names_by_call(messages: &[Message]) -> HashMap<&str, &str> {
    messages
        .iter()
        .flat_map(|m| m.tool_calls.iter())
        .map(|c| (c.id.as_str(), c.name.as_str()))
        .collect()
}

/// Scan `messages` and select the tool results to blank. Pure.
pub fn plan_prune(messages: &[Message], current_turn: u32, config: &PruneConfig) -> PrunePlan {
    let mut plan = PrunePlan::default();
    if !config.enabled {
        return plan;
    }
    let names = tool_names_by_call(messages);

    for (index, msg) in messages.iter().enumerate().rev() {
        if msg.is_summary() {
            break;
        }
        if !msg.is_tool_result() || msg.is_compacted() {
            continue;
        }
        let Some(turn) = msg.turn_index else {
            continue;
        };
        if is_protected_turn(turn, current_turn, config.recent_turns_protected) {
            continue;
        }
        let name = msg
            .tool_call_id
            .as_deref()
            .and_then(|id| names.get(id).copied())
            .or(msg.tool_name.as_deref());
        if name.is_some_and(|n| config.protected_tools.contains(n)) {
            continue;
        }

        let cost = tokens::estimate(&msg.content);
        plan.scanned_tokens += cost;
        if plan.scanned_tokens > config.protect_token_budget {
            plan.indices.push(index);
            plan.prunable_tokens += cost;
        }
    }
    plan
}

/// Blank the planned tool results. Returns the estimated tokens freed.
pub fn apply_prune(messages: &mut [Message], plan: &PrunePlan) -> PruneOutcome {
    let now = Utc::now();
    let marker_cost = tokens::estimate(PRUNED_MARKER);
    let mut outcome = PruneOutcome::default();
    for &index in &plan.indices {
        let Some(msg) = messages.get_mut(index) else {
            continue;
        };
        let before = tokens::estimate(&msg.content);
        msg.content = PRUNED_MARKER.to_string();
        msg.compacted_at = Some(now);
        outcome.pruned_count += 1;
        outcome.freed_tokens += before.saturating_sub(marker_cost);
    }
    outcome
}

/// Plan and, if worthwhile, apply a pruning pass. Returns the ids of the
/// blanked messages alongside the outcome.
pub fn prune(
    messages: &mut [Message],
    current_turn: u32,
    config: &PruneConfig,
) -> (PruneOutcome, Vec<String>) {
    let plan = plan_prune(messages, current_turn, config);
    if !plan.worth_applying(config) {
        debug!(
            "Prune skipped: {} candidate(s), {} prunable tokens (minimum {})",
            plan.indices.len(),
            plan.prunable_tokens,
            config.min_prune_tokens
        );
        return (PruneOutcome::default(), Vec::new());
    }
    let ids = plan
        .indices
        .iter()
        .filter_map(|&i| messages.get(i).map(|m| m.id.clone()))
        .collect();
    (apply_prune(messages, &plan), ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;

    /// One turn: user message, one tool call, its result of `tokens` tokens.
    fn turn(messages: &mut Vec<Message>, turn: u32, tool: &str, tokens: usize) {
        let call_id = format!("call-{turn}-{}", messages.len());
        messages.push(Message::user(format!("question {turn}")).at_turn(turn));
        messages.push(
            Message::assistant_tool_calls("", vec![ToolCall::new(&call_id, tool, "{}")])
                .at_turn(turn),
        );
        messages.push(Message::tool_result(&call_id, tool, "x".repeat(tokens * 4)).at_turn(turn));
    }

    #[test]
    fn large_old_output_is_blanked_and_recent_turns_untouched() {
        let mut messages = vec![Message::system("sys")];
        for t in 1..=25 {
            let size = if t == 5 { 50_000 } else { 10 };
            turn(&mut messages, t, "read_file", size);
        }
        let before = messages.clone();

        let (outcome, ids) = prune(&mut messages, 25, &PruneConfig::default());

        // Turn 5 tips the running total over the budget; turns 1..=4 are
        // older still and go with it.
        assert_eq!(outcome.pruned_count, 5);
        assert!(outcome.freed_tokens > 49_000);
        let pruned = messages
            .iter()
            .find(|m| m.is_tool_result() && m.turn_index == Some(5))
            .unwrap();
        assert_eq!(pruned.content, PRUNED_MARKER);
        assert!(pruned.is_compacted());
        assert!(ids.contains(&pruned.id));
        assert!(
            messages
                .iter()
                .filter(|m| m.is_tool_result() && m.turn_index.is_some_and(|t| t > 5))
                .all(|m| !m.is_compacted())
        );

        for (a, b) in messages.iter().zip(&before) {
            assert_eq!(a.id, b.id);
            if a.turn_index.is_some_and(|t| t >= 24) {
                assert_eq!(a.content, b.content);
            }
        }
    }

    #[test]
    fn below_minimum_is_noop() {
        let mut messages = Vec::new();
        for t in 1..=10 {
            turn(&mut messages, t, "grep", 5_000);
        }
        // Unprotected output: turns 1..=8, 40_000 tokens, nothing above budget.
        let (outcome, _) = prune(&mut messages, 10, &PruneConfig::default());
        assert_eq!(outcome, PruneOutcome::default());
        assert!(messages.iter().all(|m| !m.is_compacted()));
    }

    #[test]
    fn selects_oldest_beyond_budget() {
        let mut messages = Vec::new();
        for t in 1..=12 {
            turn(&mut messages, t, "grep", 10_000);
        }
        let config = PruneConfig::default();
        let plan = plan_prune(&messages, 12, &config);
        // Turns 1..=10 unprotected; the newest four fill the 40_000 budget,
        // the fifth tips it over, turns 1..=6 are selected.
        assert_eq!(plan.indices.len(), 6);
        assert_eq!(plan.prunable_tokens, 60_000);
        let turns: Vec<u32> = plan
            .indices
            .iter()
            .map(|&i| messages[i].turn_index.unwrap())
            .collect();
        assert_eq!(turns, vec![6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn protected_turn_boundary_is_kept() {
        let mut messages = Vec::new();
        turn(&mut messages, 1, "grep", 100_000);
        turn(&mut messages, 2, "grep", 100_000);
        let config = PruneConfig::default().with_budgets(0, 0);
        // current_turn - 2 == 0 and 2 - 1 == 1: both inside a two-turn window.
        let plan = plan_prune(&messages, 2, &config);
        assert!(plan.indices.is_empty());
        // Turn 1 leaves the window once turn 3 starts.
        let plan = plan_prune(&messages, 3, &config);
        assert_eq!(plan.indices.len(), 1);
    }

    #[test]
    fn protected_tools_are_skipped_and_not_counted() {
        let mut messages = Vec::new();
        turn(&mut messages, 1, "grep", 30_000);
        turn(&mut messages, 2, "skill", 50_000);
        turn(&mut messages, 3, "noop", 1);
        turn(&mut messages, 4, "noop", 1);
        let config = PruneConfig::default().protect_tool("skill");
        let plan = plan_prune(&messages, 4, &config);
        // "skill" never counts toward the budget, so 30_000 stays under it.
        assert!(plan.indices.is_empty());
        assert_eq!(plan.scanned_tokens, 30_000);
    }

    #[test]
    fn name_resolved_through_issuing_call() {
        let mut messages = Vec::new();
        turn(&mut messages, 1, "skill", 60_000);
        // Result misreports its tool name; the issuing call wins.
        messages[2].tool_name = Some("grep".into());
        turn(&mut messages, 2, "noop", 1);
        turn(&mut messages, 3, "noop", 1);
        let config = PruneConfig::default().protect_tool("skill").with_budgets(0, 0);
        assert!(plan_prune(&messages, 3, &config).indices.is_empty());
    }

    #[test]
    fn stops_at_summary_boundary() {
        let mut messages = Vec::new();
        turn(&mut messages, 1, "grep", 80_000);
        messages.push(Message::summary("earlier work", vec![]));
        turn(&mut messages, 2, "grep", 10);
        turn(&mut messages, 3, "grep", 10);
        turn(&mut messages, 4, "grep", 10);
        let config = PruneConfig::default().with_budgets(0, 0);
        let plan = plan_prune(&messages, 4, &config);
        assert_eq!(plan.indices.len(), 1);
        assert_eq!(messages[plan.indices[0]].turn_index, Some(2));
    }

    #[test]
    fn already_blanked_and_unturned_results_are_skipped() {
        let mut messages = Vec::new();
        turn(&mut messages, 1, "grep", 50_000);
        messages.push(Message::tool_result("orphan", "grep", "y".repeat(400_000)));
        turn(&mut messages, 2, "grep", 1);
        turn(&mut messages, 3, "grep", 1);
        turn(&mut messages, 4, "grep", 1);

        let config = PruneConfig::default().with_budgets(0, 0);
        let (first, _) = prune(&mut messages, 4, &config);
        assert_eq!(first.pruned_count, 2);
        assert!(messages[3].content.starts_with('y'));

        let (second, _) = prune(&mut messages, 4, &config);
        assert_eq!(second.pruned_count, 0);
    }

    #[test]
    fn disabled_config_plans_nothing() {
        let mut messages = Vec::new();
        turn(&mut messages, 1, "grep", 100_000);
        let config = PruneConfig {
            enabled: false,
            ..PruneConfig::default().with_budgets(0, 0)
        };
        assert_eq!(plan_prune(&messages, 10, &config), PrunePlan::default());
    }
}
