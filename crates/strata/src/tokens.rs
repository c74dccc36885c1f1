//! Approximate token counting.
//!
//! Every budget calculation in the crate goes through [`approximate_tokens`].
//! It is a character-count heuristic, not a BPE tokenizer: deterministic,
//! provider-agnostic, and cheap enough to run on every history mutation.

/// Default characters per token (conservative estimate for English text).
/// Most tokenizers average 3-4 chars per token; we use 3.5 as a middle ground.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Estimate the token count of `text`.
///
/// Monotonic in the number of characters; empty input is zero tokens.
pub fn approximate_tokens(text: &str) -> usize {
    tokens_for_chars(text.chars().count())
}

/// Token estimate for a known character count.
pub fn tokens_for_chars(chars: usize) -> usize {
    (chars as f64 / DEFAULT_CHARS_PER_TOKEN).ceil() as usize
}
