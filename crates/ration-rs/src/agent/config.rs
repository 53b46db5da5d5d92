//! Configuration types for the [`Harness`](super::harness::Harness).
//!
//! Compaction is **enabled by default**. Override settings through
//! [`HarnessConfig`] struct fields, the builder methods, or a TOML file.
//!
//! # Examples
//!
//! Builder methods for common settings:
//!
//! ```ignore
//! let config = HarnessConfig::new("my-model")
//!     .with_system_prompt("You are helpful.")
//!     .with_max_iterations(30)
//!     .with_context_limits(128_000, 8_192)
//!     .with_protected_tool("skill")
//!     .with_retries(3);
//! ```
//!
//! Loading from TOML; every key is optional apart from `model`:
//!
//! ```toml
//! model = "my-model"
//! max_loop_iterations = 50
//! context_limit = 128000
//!
//! [compaction]
//! recent_turns_protected = 3
//! protected_tool_names = ["skill"]
//!
//! [compaction.summary]
//! model = "cheap-model"
//!
//! [retry]
//! max_retries = 2
//! initial_delay_ms = 250
//! ```

use crate::api::retry::RetryConfig;
use crate::context::overflow::{ModelLimits, OverflowDetector};
use crate::context::prune::PruneConfig;
use crate::context::summarizer::SummarizerConfig;
use crate::context::truncate::{DEFAULT_MAX_BYTES, DEFAULT_MAX_LINES, Truncator};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

// ── Compaction config ──────────────────────────────────────────────

/// Thresholds for the truncate → prune → summarize tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Start passes automatically on overflow. When off, only
    /// [`Harness::compact_now`](super::harness::Harness::compact_now) runs one.
    pub auto_compaction: bool,
    pub prune_enabled: bool,
    /// Turns at the end of the session that are never pruned or summarized.
    pub recent_turns_protected: u32,
    /// Old tool-output tokens kept before pruning starts.
    pub protect_token_budget: u64,
    /// Minimum prunable tokens for a pruning pass to apply.
    pub min_prune_tokens: u64,
    /// Tools whose output is never pruned.
    pub protected_tool_names: BTreeSet<String>,
    pub truncate_max_lines: usize,
    pub truncate_max_bytes: usize,
    pub summary: SummarizerConfig,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            auto_compaction: true,
            prune_enabled: true,
            recent_turns_protected: 2,
            protect_token_budget: 40_000,
            min_prune_tokens: 20_000,
            protected_tool_names: BTreeSet::new(),
            truncate_max_lines: DEFAULT_MAX_LINES,
            truncate_max_bytes: DEFAULT_MAX_BYTES,
            summary: SummarizerConfig::default(),
        }
    }
}

impl CompactionConfig {
    pub fn prune_config(&self) -> PruneConfig {
        PruneConfig {
            enabled: self.prune_enabled,
            recent_turns_protected: self.recent_turns_protected,
            protect_token_budget: self.protect_token_budget,
            min_prune_tokens: self.min_prune_tokens,
            protected_tools: self.protected_tool_names.iter().cloned().collect(),
        }
    }

    /// A truncator with these ceilings and no spill store.
    pub fn truncator(&self) -> Truncator {
        Truncator::new(self.truncate_max_lines, self.truncate_max_bytes)
    }
}

// ── Main harness config ────────────────────────────────────────────

/// Configuration for a [`Harness`](super::harness::Harness) run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Model identifier passed through to the client.
    pub model: String,
    pub system_prompt: Option<String>,
    /// Maximum tokens per LLM response.
    pub max_tokens: u32,
    pub temperature: f32,
    /// Hard ceiling on model calls per run.
    pub max_loop_iterations: u32,
    /// Model context window in tokens. 0 means unknown (never overflows).
    pub context_limit: u64,
    /// The model's own output limit.
    pub model_output_limit: u64,
    /// Configured cap on reserved output tokens.
    pub output_token_cap: u64,
    pub llm_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    /// Validate tool arguments against each tool's JSON Schema.
    pub validate_tool_args: bool,
    /// Retry for transient provider failures. Off by default.
    pub retry: RetryConfig,
    pub compaction: CompactionConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            system_prompt: None,
            max_tokens: 1024,
            temperature: 0.7,
            max_loop_iterations: 100,
            context_limit: 200_000,
            model_output_limit: 8_192,
            output_token_cap: 32_000,
            llm_timeout_secs: 300,
            tool_timeout_secs: 60,
            validate_tool_args: false,
            retry: RetryConfig::default(),
            compaction: CompactionConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Create a config for `model` with defaults everywhere else.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::Validation("model must not be empty".into()));
        }
        if self.max_loop_iterations == 0 {
            return Err(ConfigError::Validation(
                "max_loop_iterations must be at least 1".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Validation(format!(
                "temperature must be within 0.0..=2.0, got {}",
                self.temperature
            )));
        }
        if self.context_limit > 0 {
            let reserved = self.model_output_limit.min(self.output_token_cap);
            if reserved >= self.context_limit {
                return Err(ConfigError::Validation(format!(
                    "reserved output ({reserved}) leaves no room in a {}-token context",
                    self.context_limit
                )));
            }
        }
        if self.llm_timeout_secs == 0 || self.tool_timeout_secs == 0 {
            return Err(ConfigError::Validation("timeouts must be non-zero".into()));
        }
        if self.compaction.truncate_max_lines == 0 || self.compaction.truncate_max_bytes == 0 {
            return Err(ConfigError::Validation(
                "truncation ceilings must be non-zero".into(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "retry.multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }

    // ── Builder methods ───────────────────────────────────────────

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Set the maximum number of model calls per run.
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_loop_iterations = max_iterations;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the model's context window and output limit.
    pub fn with_context_limits(mut self, context_limit: u64, model_output_limit: u64) -> Self {
        self.context_limit = context_limit;
        self.model_output_limit = model_output_limit;
        self
    }

    pub fn with_output_cap(mut self, cap: u64) -> Self {
        self.output_token_cap = cap;
        self
    }

    /// Enable automatic retries for transient provider failures. Pass `0`
    /// to disable retries (the default).
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry = RetryConfig::with_retries(max_retries);
        self
    }

    pub fn with_llm_timeout(mut self, timeout: Duration) -> Self {
        self.llm_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_arg_validation(mut self, enabled: bool) -> Self {
        self.validate_tool_args = enabled;
        self
    }

    /// Turn automatic compaction on or off (manual-only when off).
    pub fn with_auto_compaction(mut self, enabled: bool) -> Self {
        self.compaction.auto_compaction = enabled;
        self
    }

    /// Exempt a tool's output from pruning.
    pub fn with_protected_tool(mut self, name: impl Into<String>) -> Self {
        self.compaction.protected_tool_names.insert(name.into());
        self
    }

    pub fn with_recent_turns_protected(mut self, turns: u32) -> Self {
        self.compaction.recent_turns_protected = turns;
        self
    }

    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }

    // ── Derived components ────────────────────────────────────────

    pub fn model_limits(&self) -> ModelLimits {
        ModelLimits {
            context: self.context_limit,
            output: self.model_output_limit,
        }
    }

    pub fn detector(&self) -> OverflowDetector {
        OverflowDetector::new(self.model_limits(), self.output_token_cap)
            .with_auto_compaction(self.compaction.auto_compaction)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}
