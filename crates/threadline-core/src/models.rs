//! Core data models used throughout threadline.
//!
//! Conversations and exchanges come in from the corpus; chunks and
//! [`IndexMeta`] are what the vector index persists; [`SearchResult`] and
//! [`ConversationScore`] are ephemeral query outputs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Schema version written into every [`IndexMeta`] and the store itself.
pub const SCHEMA_VERSION: u32 = 3;

/// A prompt + response pair, the atomic unit of chunk accumulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    /// Globally unique exchange identifier.
    pub id: String,
    pub prompt: String,
    pub response: String,
    /// Unix timestamp (seconds) of the exchange.
    pub timestamp: i64,
}

impl Exchange {
    /// Rendered text used for embedding.
    pub fn render(&self) -> String {
        format!(
            "User: {}\n\nAssistant: {}",
            self.prompt.trim(),
            self.response.trim()
        )
    }
}

/// A normalized conversation record as produced by the per-tool parsers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub started_at: i64,
    #[serde(default)]
    pub exchanges: Vec<Exchange>,
}

/// Which side of an exchange a chunk was cut from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkRole {
    User,
    Assistant,
    /// A window of one or more whole exchanges.
    Exchange,
}

impl ChunkRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkRole::User => "user",
            ChunkRole::Assistant => "assistant",
            ChunkRole::Exchange => "exchange",
        }
    }

    /// Whether a chunk with this role satisfies a role filter.
    ///
    /// Exchange windows carry both sides, so they satisfy either filter.
    pub fn admits(&self, wanted: ChunkRole) -> bool {
        *self == wanted || *self == ChunkRole::Exchange
    }
}

impl fmt::Display for ChunkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(ChunkRole::User),
            "assistant" => Ok(ChunkRole::Assistant),
            "exchange" => Ok(ChunkRole::Exchange),
            other => anyhow::bail!(
                "Unknown chunk role: '{}'. Must be user, assistant, or exchange.",
                other
            ),
        }
    }
}

/// A contiguous, token-bounded span of exchange text with its vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    /// UUIDv7 derived from `timestamp`; sorts by source time.
    pub id: String,
    pub conversation_id: String,
    pub role: ChunkRole,
    pub exchange_ids: Vec<String>,
    pub text: String,
    /// Measured with the embedding model's own tokenizer.
    pub token_count: usize,
    #[serde(skip)]
    pub vector: Vec<f32>,
    /// Timestamp of the first exchange that contributed to this chunk.
    pub timestamp: i64,
}

/// Token-length distribution of the chunks produced by a build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenStats {
    pub count: usize,
    pub min: usize,
    pub mean: f64,
    pub p50: usize,
    pub p95: usize,
    pub max: usize,
}

impl TokenStats {
    /// Nearest-rank percentiles over the given counts.
    pub fn from_counts(counts: &[usize]) -> Self {
        if counts.is_empty() {
            return Self::default();
        }
        let mut sorted = counts.to_vec();
        sorted.sort_unstable();
        let n = sorted.len();
        let rank = |p: f64| -> usize {
            let idx = ((p * n as f64).ceil() as usize).clamp(1, n) - 1;
            sorted[idx]
        };
        Self {
            count: n,
            min: sorted[0],
            mean: sorted.iter().sum::<usize>() as f64 / n as f64,
            p50: rank(0.50),
            p95: rank(0.95),
            max: sorted[n - 1],
        }
    }
}

/// The (backend, model, dimension) triple an index is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendFingerprint {
    pub backend: String,
    pub model: String,
    pub dims: usize,
}

impl fmt::Display for BackendFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({} dims)", self.backend, self.model, self.dims)
    }
}

/// Describes how the active vector index was built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub schema_version: u32,
    pub backend: String,
    pub model: String,
    pub dims: usize,
    pub max_seq_len: usize,
    /// Unix timestamp of the last write to this generation.
    pub built_at: i64,
    pub token_stats: TokenStats,
    /// Exchanges that needed recursive splitting.
    pub split_exchanges: u64,
    /// Fragments that had to be cut at a raw token boundary.
    pub truncations: u64,
    /// Build generation this row describes.
    pub generation: i64,
}

impl IndexMeta {
    pub fn fingerprint(&self) -> BackendFingerprint {
        BackendFingerprint {
            backend: self.backend.clone(),
            model: self.model.clone(),
            dims: self.dims,
        }
    }
}

/// Fixed-field score breakdown attached to every search result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    /// Raw cosine similarity between query and chunk.
    pub similarity: f32,
    /// Additive recency adjustment (0.0 when disabled).
    pub recency_boost: f32,
    /// `similarity + recency_boost`; the relevance MMR starts from.
    pub pre_mmr_score: f32,
    /// Redundancy penalty applied by the diversity rerank: `1.0` for a
    /// repeat conversation, else the raw cosine to the closest selected
    /// chunk, which may be negative.
    pub mmr_penalty: f32,
    /// Zero-based position chosen by the diversity rerank.
    pub mmr_rank: usize,
    /// Score the final ordering was decided on.
    pub final_score: f32,
}

/// A single ranked chunk returned by the retriever.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub conversation_id: String,
    pub role: ChunkRole,
    pub exchange_ids: Vec<String>,
    pub text: String,
    /// Source timestamp of the exchange that produced the chunk.
    pub timestamp: i64,
    /// Whether the conversation was surfaced by lexical recall.
    pub lexical_match: bool,
    pub score: ScoreBreakdown,
}

impl SearchResult {
    /// Relevance used by aggregation and earliest-mention lookup.
    pub fn relevance(&self) -> f32 {
        self.score.pre_mmr_score
    }
}

/// Conversation-level aggregate over ranked chunks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationScore {
    pub conversation_id: String,
    pub max_score: f32,
    pub mean_score: f32,
    pub chunk_count: usize,
    pub best_chunk_id: String,
    pub best_excerpt: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_stats_empty() {
        assert_eq!(TokenStats::from_counts(&[]), TokenStats::default());
    }

    #[test]
    fn test_token_stats_distribution() {
        let counts: Vec<usize> = (1..=100).collect();
        let stats = TokenStats::from_counts(&counts);
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min, 1);
        assert_eq!(stats.max, 100);
        assert_eq!(stats.p50, 50);
        assert_eq!(stats.p95, 95);
        assert!((stats.mean - 50.5).abs() < 1e-9);
    }

    #[test]
    fn test_role_admits() {
        assert!(ChunkRole::Exchange.admits(ChunkRole::User));
        assert!(ChunkRole::Exchange.admits(ChunkRole::Assistant));
        assert!(ChunkRole::User.admits(ChunkRole::User));
        assert!(!ChunkRole::Assistant.admits(ChunkRole::User));
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("user".parse::<ChunkRole>().unwrap(), ChunkRole::User);
        assert!("system".parse::<ChunkRole>().is_err());
    }

    #[test]
    fn test_exchange_render() {
        let ex = Exchange {
            id: "e1".into(),
            prompt: " how do I refresh a token? ".into(),
            response: "Call the refresh endpoint.".into(),
            timestamp: 0,
        };
        assert_eq!(
            ex.render(),
            "User: how do I refresh a token?\n\nAssistant: Call the refresh endpoint."
        );
    }
}
