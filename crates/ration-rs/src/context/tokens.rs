//! Cheap token estimation.
//!
//! This is an approximation, not a tokenizer. Each character is weighted by
//! class in quarter-token units and the sum is rounded up:
//!
//! | Class | Weight |
//! |-------|--------|
//! | ASCII | 1/4 token |
//! | other narrow non-ASCII (accented Latin, Cyrillic, ...) | 1/2 token |
//! | wide: CJK, kana, Hangul, full-width forms, emoji | 1 token |
//!
//! The estimate is zero for empty text and never decreases when text is
//! appended, which is all the overflow policy relies on.

use crate::Message;

/// Fixed cost charged per message for role and framing tokens.
pub const MESSAGE_OVERHEAD_TOKENS: u64 = 4;

const UNITS_PER_TOKEN: u64 = 4;

fn is_wide(c: char) -> bool {
    matches!(
        c as u32,
        0x1100..=0x115F           // Hangul Jamo
        | 0x2E80..=0x303E         // CJK radicals, punctuation
        | 0x3041..=0x33FF         // Hiragana, Katakana, CJK compatibility
        | 0x3400..=0x4DBF         // CJK extension A
        | 0x4E00..=0x9FFF         // CJK unified ideographs
        | 0xA000..=0xA4CF         // Yi
        | 0xAC00..=0xD7A3         // Hangul syllables
        | 0xF900..=0xFAFF         // CJK compatibility ideographs
        | 0xFE30..=0xFE4F         // CJK compatibility forms
        | 0xFF00..=0xFF60         // full-width forms
        | 0xFFE0..=0xFFE6
        | 0x1F300..=0x1FAFF       // emoji and pictographs
        | 0x20000..=0x3FFFD // CJK extensions B and later
    )
}

fn char_units(c: char) -> u64 {
    if c.is_ascii() {
        1
    } else if is_wide(c) {
        4
    } else {
        2
    }
}

/// Estimate the token cost of `text`.
pub fn estimate(text: &str) -> u64 {
    let units: u64 = text.chars().map(char_units).sum();
    units.div_ceil(UNITS_PER_TOKEN)
}

/// Estimate one message: content, tool-call names and arguments, plus the
/// per-message overhead.
pub fn estimate_message(message: &Message) -> u64 {
    let calls: u64 = message
        .tool_calls
        .iter()
        .map(|c| estimate(&c.name) + estimate(&c.arguments))
        .sum();
    estimate(&message.content) + calls + MESSAGE_OVERHEAD_TOKENS
}

/// Estimate a whole transcript.
pub fn estimate_total(messages: &[Message]) -> u64 {
    messages.iter().map(estimate_message).sum()
}
