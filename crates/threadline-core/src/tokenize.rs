//! Token counting seam between the chunker and the embedding model.
//!
//! Chunk sizes are measured with the tokenizer of the model that will embed
//! them. Implementations live next to each backend; the chunker only sees
//! this trait.

/// Counts and cuts text in units of the embedding model's tokens.
pub trait TokenCounter: Send + Sync {
    /// Number of tokens the model sees for `text`, special tokens included.
    fn count(&self, text: &str) -> usize;

    /// Longest prefix of `text`, ending on a token boundary, whose
    /// [`count`](TokenCounter::count) is at most `max_tokens`.
    fn truncate<'a>(&self, text: &'a str, max_tokens: usize) -> &'a str;

    /// Suffix of `text`, starting on a token boundary, holding at most
    /// `max_tokens` content tokens.
    fn tail<'a>(&self, text: &'a str, max_tokens: usize) -> &'a str;
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
pub fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
