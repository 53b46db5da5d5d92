//! Context-budget management: estimation, overflow policy, and the three
//! compaction tiers.
//!
//! 1. **[`truncate`]**: tool output over the line or byte ceiling is cut to
//!    a bounded preview when recorded. The full payload can be spilled to a
//!    [`SpillStore`].
//!
//! 2. **[`prune`]**: old tool results beyond a protected token budget are
//!    blanked in place. No model call needed.
//!
//! 3. **[`summarizer`]**: history between the last summary boundary and the
//!    protected tail is replaced by one model-written summary.
//!
//! [`overflow`] decides when a pass is needed, using [`tokens`] estimates
//! when the provider has not reported usage. [`compaction`] runs the tiers
//! in order and is invoked by the [`Harness`](crate::agent::harness::Harness)
//! before any model call that would overflow.

pub mod compaction;
pub mod overflow;
pub mod prune;
pub mod summarizer;
pub mod tokens;
pub mod truncate;

// Re-export commonly used items at the module level.
pub use compaction::{
    CompactionEngine, CompactionPhase, CompactionReport, CompactionTrigger, SummaryOutcome,
};
pub use overflow::{ModelLimits, OverflowDetector, TokenUsage, is_overflow};
pub use prune::{PRUNED_MARKER, PruneConfig, PruneOutcome};
pub use summarizer::{LlmSummarizer, Summarizer, SummarizerConfig};
pub use truncate::{DirSpillStore, MemorySpillStore, SpillStore, Truncator};
