//! Overflow policy: does the projected usage still fit the context window?
//!
//! Part of the window is reserved for the model's reply. The reserve is the
//! smaller of the model's own output limit and the configured output cap, so
//! a generous cap never reserves more than the model can emit.

use serde::{Deserialize, Serialize};

/// Token usage reported for (or projected onto) one model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, cache_read_tokens: u64, output_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            cache_read_tokens,
            output_tokens,
        }
    }

    /// Usage known only from the estimator: everything counts as prompt.
    pub fn estimated(prompt_tokens: u64) -> Self {
        Self::new(prompt_tokens, 0, 0)
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens
            .saturating_add(self.cache_read_tokens)
            .saturating_add(self.output_tokens)
    }

    /// Grow the prompt side by tokens appended since this usage was reported.
    pub fn plus_prompt(self, tokens: u64) -> Self {
        Self {
            prompt_tokens: self.prompt_tokens.saturating_add(tokens),
            ..self
        }
    }

    /// Shrink the prompt side by tokens freed by compaction.
    pub fn minus_prompt(self, tokens: u64) -> Self {
        Self {
            prompt_tokens: self.prompt_tokens.saturating_sub(tokens),
            ..self
        }
    }
}

/// Context and output limits of a model. A `context` of 0 means unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLimits {
    pub context: u64,
    pub output: u64,
}

/// Tokens usable for prompt plus reply. `None` when the context limit is unknown.
pub fn usable_context(context_limit: u64, model_output_limit: u64, output_cap: u64) -> Option<u64> {
    if context_limit == 0 {
        return None;
    }
    let reserved = model_output_limit.min(output_cap);
    Some(context_limit.saturating_sub(reserved))
}

/// Whether the given usage exceeds the usable window.
///
/// `total = prompt + cache_read + output`, `available = context - min(model
/// output limit, cap)`, overflow iff `total > available`. An unknown (zero)
/// context limit never overflows.
pub fn is_overflow(
    prompt_tokens: u64,
    cache_read_tokens: u64,
    output_tokens: u64,
    context_limit: u64,
    model_output_limit: u64,
    output_cap: u64,
) -> bool {
    let Some(available) = usable_context(context_limit, model_output_limit, output_cap) else {
        return false;
    };
    TokenUsage::new(prompt_tokens, cache_read_tokens, output_tokens).total() > available
}

/// [`is_overflow`] bound to one model's limits, plus the automatic-compaction switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowDetector {
    limits: ModelLimits,
    output_cap: u64,
    auto_compaction: bool,
}

impl OverflowDetector {
    pub fn new(limits: ModelLimits, output_cap: u64) -> Self {
        Self {
            limits,
            output_cap,
            auto_compaction: true,
        }
    }

    /// Turn automatic triggering on or off. When off, only manual
    /// compaction requests run a pass.
    pub fn with_auto_compaction(mut self, enabled: bool) -> Self {
        self.auto_compaction = enabled;
        self
    }

    pub fn limits(&self) -> ModelLimits {
        self.limits
    }

    /// Usable tokens, or `None` for an unknown context limit.
    pub fn available(&self) -> Option<u64> {
        usable_context(self.limits.context, self.limits.output, self.output_cap)
    }

    /// Pure policy check, ignoring the automatic switch.
    pub fn is_overflow(&self, usage: &TokenUsage) -> bool {
        is_overflow(
            usage.prompt_tokens,
            usage.cache_read_tokens,
            usage.output_tokens,
            self.limits.context,
            self.limits.output,
            self.output_cap,
        )
    }

    /// Whether the loop should start a compaction pass on its own.
    pub fn should_compact(&self, usage: &TokenUsage) -> bool {
        self.auto_compaction && self.is_overflow(usage)
    }
}
