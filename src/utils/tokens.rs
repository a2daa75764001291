//! Token count estimation

/// Rough token estimate used for streaming progress: one token per four characters.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() + 3) / 4
}
