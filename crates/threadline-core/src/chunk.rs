//! Exchange-window chunker.
//!
//! Turns a conversation's ordered exchanges into [`Chunk`]s sized for the
//! embedding model. Sizes are always measured with the model's own
//! tokenizer through [`TokenCounter`].
//!
//! # Algorithm
//!
//! 1. Render each exchange as `User: …\n\nAssistant: …` and treat it as an
//!    atomic unit.
//! 2. Accumulate consecutive units into a window until adding the next one
//!    would exceed `target_tokens`, then close the window as a chunk.
//! 3. Start the next window with the last `overlap_tokens` of the closed
//!    window, when that carry still fits under `max_tokens`.
//! 4. An exchange that alone exceeds `max_tokens` is split: prompt and
//!    response separately, each recursively by [`SplitStrategy`] in
//!    precedence order. Cut points inside fenced code blocks are only used
//!    when nothing else reduces the text. Whatever still does not fit is cut
//!    at a raw token boundary and counted as a truncation.
//!
//! No chunk produced here exceeds `max_tokens`.

use anyhow::{bail, Result};
use uuid::{NoContext, Timestamp, Uuid};

use crate::models::{Chunk, ChunkRole, Exchange};
use crate::tokenize::TokenCounter;

/// Chunk sizing, in model tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingParams {
    /// Soft target; windows close before exceeding it.
    pub target_tokens: usize,
    /// Hard ceiling for every chunk.
    pub max_tokens: usize,
    /// Trailing context carried into the next window.
    pub overlap_tokens: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            target_tokens: 256,
            max_tokens: 384,
            overlap_tokens: 32,
        }
    }
}

impl ChunkingParams {
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens < 8 {
            bail!("chunking.max_tokens must be at least 8");
        }
        if self.target_tokens == 0 || self.target_tokens > self.max_tokens {
            bail!("chunking.target_tokens must be in 1..=max_tokens");
        }
        if self.overlap_tokens >= self.target_tokens {
            bail!("chunking.overlap_tokens must be smaller than target_tokens");
        }
        Ok(())
    }

    /// Tighten the limits so no chunk can exceed the model's sequence length.
    pub fn fit_to_model(self, max_seq_len: usize) -> Self {
        let max_tokens = self.max_tokens.min(max_seq_len);
        let target_tokens = self.target_tokens.min(max_tokens);
        Self {
            target_tokens,
            max_tokens,
            overlap_tokens: self.overlap_tokens.min(target_tokens.saturating_sub(1)),
        }
    }
}

/// Separator classes for recursive splitting, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitStrategy {
    /// Blank-line boundaries.
    Paragraph,
    /// Sentence-ending punctuation followed by whitespace, and line breaks.
    Sentence,
    /// Word boundaries.
    Whitespace,
}

impl SplitStrategy {
    pub const ALL: [SplitStrategy; 3] = [
        SplitStrategy::Paragraph,
        SplitStrategy::Sentence,
        SplitStrategy::Whitespace,
    ];

    /// Split `text` at this strategy's separators.
    ///
    /// Returns `None` when the split would not make progress (fewer than two
    /// non-blank segments). Segments are contiguous slices; concatenating
    /// them yields `text` again.
    pub fn split<'a>(&self, text: &'a str, respect_fences: bool) -> Option<Vec<&'a str>> {
        let fences = if respect_fences {
            fence_spans(text)
        } else {
            Vec::new()
        };
        let cuts: Vec<usize> = self
            .cut_points(text)
            .into_iter()
            .filter(|&p| p > 0 && p < text.len())
            .filter(|&p| !fences.iter().any(|&(start, end)| start < p && p < end))
            .collect();

        let mut segments = Vec::with_capacity(cuts.len() + 1);
        let mut last = 0;
        for cut in cuts {
            if cut > last {
                segments.push(&text[last..cut]);
                last = cut;
            }
        }
        segments.push(&text[last..]);

        let non_blank = segments.iter().filter(|s| !s.trim().is_empty()).count();
        if non_blank >= 2 {
            Some(segments)
        } else {
            None
        }
    }

    fn cut_points(&self, text: &str) -> Vec<usize> {
        match self {
            SplitStrategy::Paragraph => text.match_indices("\n\n").map(|(i, _)| i + 2).collect(),
            SplitStrategy::Sentence => {
                let mut cuts = Vec::new();
                let mut chars = text.char_indices().peekable();
                while let Some((i, c)) = chars.next() {
                    if c == '\n' {
                        cuts.push(i + 1);
                    } else if matches!(c, '.' | '!' | '?') {
                        if let Some(&(j, next)) = chars.peek() {
                            if next.is_whitespace() {
                                cuts.push(j);
                            }
                        }
                    }
                }
                cuts
            }
            SplitStrategy::Whitespace => {
                let mut cuts = Vec::new();
                let mut prev_ws = false;
                for (i, c) in text.char_indices() {
                    if prev_ws && !c.is_whitespace() {
                        cuts.push(i);
                    }
                    prev_ws = c.is_whitespace();
                }
                cuts
            }
        }
    }
}

/// Byte spans covered by ``` fenced blocks. An unclosed fence runs to the end.
fn fence_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut open: Option<usize> = None;
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.trim_start().starts_with("```") {
            match open.take() {
                Some(start) => spans.push((start, offset + line.len())),
                None => open = Some(offset),
            }
        }
        offset += line.len();
    }
    if let Some(start) = open {
        spans.push((start, text.len()));
    }
    spans
}

/// Chunks of one conversation plus the counters a build reports.
#[derive(Debug, Default)]
pub struct ChunkedConversation {
    pub chunks: Vec<Chunk>,
    /// Exchanges that exceeded `max_tokens` and had to be split.
    pub split_exchanges: u64,
    /// Fragments cut at a raw token boundary.
    pub truncations: u64,
}

/// Chunk a conversation's exchanges, in order.
///
/// Returned chunks carry no vector yet.
pub fn chunk_conversation(
    conversation_id: &str,
    exchanges: &[Exchange],
    params: &ChunkingParams,
    counter: &dyn TokenCounter,
) -> ChunkedConversation {
    let mut out = ChunkedConversation::default();
    let mut window = Window::default();
    let mut carry = String::new();

    for exchange in exchanges {
        let rendered = exchange.render();

        if counter.count(&rendered) > params.max_tokens {
            if let Some(text) = window.close() {
                push_chunk(&mut out, conversation_id, ChunkRole::Exchange, &window, text, params, counter);
            }
            window = Window::default();
            carry.clear();

            out.split_exchanges += 1;
            for (role, piece) in split_exchange(exchange, params.max_tokens, counter, &mut out.truncations) {
                let single = Window::single(exchange);
                push_chunk(&mut out, conversation_id, role, &single, piece, params, counter);
            }
            continue;
        }

        if !window.is_empty() {
            let candidate = format!("{}\n\n{}", window.text, rendered);
            if counter.count(&candidate) <= params.target_tokens {
                window.text = candidate;
                window.exchange_ids.push(exchange.id.clone());
                continue;
            }
            carry = counter.tail(&window.text, params.overlap_tokens).trim().to_string();
            if let Some(text) = window.close() {
                push_chunk(&mut out, conversation_id, ChunkRole::Exchange, &window, text, params, counter);
            }
        }

        window = Window::single(exchange);
        if !carry.is_empty() {
            let with_carry = format!("{}\n\n{}", carry, rendered);
            if counter.count(&with_carry) <= params.max_tokens {
                window.text = with_carry;
            }
        }
        window.text_or(rendered);
    }

    if let Some(text) = window.close() {
        push_chunk(&mut out, conversation_id, ChunkRole::Exchange, &window, text, params, counter);
    }

    out
}

#[derive(Debug, Default)]
struct Window {
    text: String,
    exchange_ids: Vec<String>,
    timestamp: i64,
}

impl Window {
    fn single(exchange: &Exchange) -> Self {
        Self {
            text: String::new(),
            exchange_ids: vec![exchange.id.clone()],
            timestamp: exchange.timestamp,
        }
    }

    fn is_empty(&self) -> bool {
        self.exchange_ids.is_empty()
    }

    fn text_or(&mut self, fallback: String) {
        if self.text.is_empty() {
            self.text = fallback;
        }
    }

    /// Take the window text if the window holds any exchange.
    fn close(&mut self) -> Option<String> {
        if self.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.text))
        }
    }
}

fn push_chunk(
    out: &mut ChunkedConversation,
    conversation_id: &str,
    role: ChunkRole,
    window: &Window,
    text: String,
    params: &ChunkingParams,
    counter: &dyn TokenCounter,
) {
    let mut text = text.trim().to_string();
    let mut token_count = counter.count(&text);
    if token_count > params.max_tokens {
        text = counter.truncate(&text, params.max_tokens).trim().to_string();
        token_count = counter.count(&text);
        out.truncations += 1;
    }
    if text.is_empty() {
        return;
    }
    out.chunks.push(Chunk {
        id: chunk_id(window.timestamp),
        conversation_id: conversation_id.to_string(),
        role,
        exchange_ids: window.exchange_ids.clone(),
        text,
        token_count,
        vector: Vec::new(),
        timestamp: window.timestamp,
    });
}

/// Time-sortable chunk identifier derived from the source timestamp.
pub fn chunk_id(timestamp: i64) -> String {
    let secs = timestamp.max(0) as u64;
    Uuid::new_v7(Timestamp::from_unix(NoContext, secs, 0)).to_string()
}

/// Split an oversized exchange into labelled prompt and response fragments.
fn split_exchange(
    exchange: &Exchange,
    max_tokens: usize,
    counter: &dyn TokenCounter,
    truncations: &mut u64,
) -> Vec<(ChunkRole, String)> {
    let sides = [
        (ChunkRole::User, "User", exchange.prompt.trim()),
        (ChunkRole::Assistant, "Assistant", exchange.response.trim()),
    ];
    let mut fragments = Vec::new();
    for (role, label, body) in sides {
        if body.is_empty() {
            continue;
        }
        let text = format!("{}: {}", label, body);
        for piece in split_text(&text, &SplitStrategy::ALL, max_tokens, counter, true, truncations) {
            fragments.push((role, piece));
        }
    }
    fragments
}

/// Recursively split `text` until every piece fits in `max_tokens`.
///
/// Returned pieces are trimmed and never blank.
pub fn split_text(
    text: &str,
    strategies: &[SplitStrategy],
    max_tokens: usize,
    counter: &dyn TokenCounter,
    respect_fences: bool,
    truncations: &mut u64,
) -> Vec<String> {
    let pieces = split_recursive(text, strategies, max_tokens, counter, respect_fences, truncations);
    non_blank(pieces.into_iter().map(|p| p.trim().to_string()).collect())
}

// Pieces keep their separators so that merging re-joins them verbatim.
fn split_recursive(
    text: &str,
    strategies: &[SplitStrategy],
    max_tokens: usize,
    counter: &dyn TokenCounter,
    respect_fences: bool,
    truncations: &mut u64,
) -> Vec<String> {
    if counter.count(text.trim()) <= max_tokens {
        return vec![text.to_string()];
    }

    for (i, strategy) in strategies.iter().enumerate() {
        let Some(segments) = strategy.split(text, respect_fences) else {
            continue;
        };
        let rest = &strategies[i + 1..];
        let mut pieces = Vec::new();
        for segment in segments {
            pieces.extend(split_recursive(segment, rest, max_tokens, counter, respect_fences, truncations));
        }
        return merge_pieces(pieces, max_tokens, counter);
    }

    if respect_fences {
        return split_recursive(text, &SplitStrategy::ALL, max_tokens, counter, false, truncations);
    }

    *truncations += 1;
    hard_split(text, max_tokens, counter)
}

/// Greedily re-join adjacent pieces while they fit.
fn merge_pieces(pieces: Vec<String>, max_tokens: usize, counter: &dyn TokenCounter) -> Vec<String> {
    let mut merged = Vec::new();
    let mut buf = String::new();
    for piece in pieces {
        if buf.trim().is_empty() {
            buf.push_str(&piece);
            continue;
        }
        let candidate = format!("{}{}", buf, piece);
        if counter.count(candidate.trim()) <= max_tokens {
            buf = candidate;
        } else {
            merged.push(std::mem::replace(&mut buf, piece));
        }
    }
    merged.push(buf);
    merged
}

/// Cut at raw token boundaries; always advances by at least one character.
fn hard_split(text: &str, max_tokens: usize, counter: &dyn TokenCounter) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = text.trim();
    while !rest.is_empty() {
        let head = counter.truncate(rest, max_tokens);
        let cut = if head.is_empty() {
            rest.char_indices().nth(1).map(|(i, _)| i).unwrap_or(rest.len())
        } else {
            head.len()
        };
        pieces.push(rest[..cut].to_string());
        rest = rest[cut..].trim_start();
    }
    pieces
}

fn non_blank(pieces: Vec<String>) -> Vec<String> {
    pieces.into_iter().filter(|p| !p.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::WordTokenCounter;

    fn exchange(id: &str, prompt: &str, response: &str, ts: i64) -> Exchange {
        Exchange {
            id: id.into(),
            prompt: prompt.into(),
            response: response.into(),
            timestamp: ts,
        }
    }

    fn words(n: usize, word: &str) -> String {
        vec![word; n].join(" ")
    }

    fn params(target: usize, max: usize, overlap: usize) -> ChunkingParams {
        ChunkingParams {
            target_tokens: target,
            max_tokens: max,
            overlap_tokens: overlap,
        }
    }

    #[test]
    fn test_small_exchanges_share_a_window() {
        let exs = vec![
            exchange("e1", "hi there", "hello", 10),
            exchange("e2", "how are you", "fine thanks", 20),
        ];
        let out = chunk_conversation("c1", &exs, &params(50, 60, 5), &WordTokenCounter);
        assert_eq!(out.chunks.len(), 1);
        let chunk = &out.chunks[0];
        assert_eq!(chunk.role, ChunkRole::Exchange);
        assert_eq!(chunk.exchange_ids, vec!["e1", "e2"]);
        assert_eq!(chunk.timestamp, 10);
        assert!(chunk.text.starts_with("User: hi there\n\nAssistant: hello"));
        assert_eq!(out.split_exchanges, 0);
    }

    #[test]
    fn test_window_closes_at_target_and_carries_overlap() {
        // Each exchange renders to 12 words.
        let exs: Vec<Exchange> = (0..4)
            .map(|i| exchange(&format!("e{i}"), &words(5, "ask"), &words(5, "say"), i))
            .collect();
        let out = chunk_conversation("c1", &exs, &params(30, 40, 3), &WordTokenCounter);
        assert_eq!(out.chunks.len(), 2);
        assert_eq!(out.chunks[0].exchange_ids, vec!["e0", "e1"]);
        assert_eq!(out.chunks[1].exchange_ids, vec!["e2", "e3"]);
        // carry of 3 words from the previous window
        assert!(out.chunks[1].text.starts_with("say say say\n\nUser:"));
        for chunk in &out.chunks {
            assert!(chunk.token_count <= 40);
        }
    }

    #[test]
    fn test_no_overlap_when_zero() {
        let exs: Vec<Exchange> = (0..3)
            .map(|i| exchange(&format!("e{i}"), &words(5, "ask"), &words(5, "say"), i))
            .collect();
        let out = chunk_conversation("c1", &exs, &params(12, 40, 0), &WordTokenCounter);
        assert_eq!(out.chunks.len(), 3);
        assert!(out.chunks[1].text.starts_with("User:"));
    }

    #[test]
    fn test_oversized_exchange_splits_by_side() {
        let prompt = format!("{}.\n\n{}.", words(20, "alpha"), words(20, "beta"));
        let exs = vec![exchange("big", &prompt, "short answer", 5)];
        let out = chunk_conversation("c1", &exs, &params(16, 24, 2), &WordTokenCounter);
        assert_eq!(out.split_exchanges, 1);
        assert_eq!(out.truncations, 0);
        let roles: Vec<ChunkRole> = out.chunks.iter().map(|c| c.role).collect();
        assert_eq!(roles, vec![ChunkRole::User, ChunkRole::User, ChunkRole::Assistant]);
        assert!(out.chunks.iter().all(|c| c.token_count <= 24));
        assert!(out.chunks.iter().all(|c| c.exchange_ids == vec!["big"]));
    }

    #[test]
    fn test_fence_is_kept_whole_when_possible() {
        let code = "```\nfn main() {\n\n    run();\n}\n```";
        let text = format!("{}\n\n{}\n\n{}", words(6, "intro"), code, words(6, "outro"));
        let pieces = split_text(&text, &SplitStrategy::ALL, 8, &WordTokenCounter, true, &mut 0);
        assert!(pieces.iter().any(|p| p == code), "pieces: {pieces:?}");
    }

    #[test]
    fn test_oversized_fence_is_split_as_last_resort() {
        let code = format!("```\n{}\n```", words(30, "x"));
        let mut truncations = 0;
        let pieces = split_text(&code, &SplitStrategy::ALL, 10, &WordTokenCounter, true, &mut truncations);
        assert!(pieces.len() >= 3);
        assert!(pieces.iter().all(|p| WordTokenCounter.count(p) <= 10));
        assert_eq!(truncations, 0);
    }

    #[test]
    fn test_unsplittable_text_is_truncated_and_counted() {
        let blob = "x".repeat(50);
        let counter = crate::testing::CharTokenCounter;
        let mut truncations = 0;
        let pieces = split_text(&blob, &SplitStrategy::ALL, 20, &counter, true, &mut truncations);
        assert_eq!(truncations, 1);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces.concat(), blob);
    }

    #[test]
    fn test_split_reports_no_progress() {
        assert!(SplitStrategy::Paragraph.split("one paragraph only", true).is_none());
        assert!(SplitStrategy::Whitespace.split("word", true).is_none());
        let parts = SplitStrategy::Sentence.split("One. Two! Three?", true).unwrap();
        assert_eq!(parts.concat(), "One. Two! Three?");
        assert_eq!(parts.len(), 3);
    }

    #[test]
    fn test_chunk_ids_sort_by_timestamp() {
        let early = chunk_id(1_600_000_000);
        let late = chunk_id(1_700_000_000);
        assert!(early < late);
        assert_ne!(chunk_id(5), chunk_id(5));
    }

    #[test]
    fn test_params_validate_and_fit() {
        assert!(ChunkingParams::default().validate().is_ok());
        assert!(params(100, 50, 10).validate().is_err());
        assert!(params(50, 100, 50).validate().is_err());
        let fitted = ChunkingParams::default().fit_to_model(128);
        assert_eq!(fitted, params(128, 128, 32));
    }

    #[test]
    fn test_empty_conversation() {
        let out = chunk_conversation("c1", &[], &ChunkingParams::default(), &WordTokenCounter);
        assert!(out.chunks.is_empty());
    }
}
