//! Three-stage hybrid retriever.
//!
//! # Algorithm
//!
//! 1. **Lexical recall.** Ask the [`LexicalRecall`] collaborator for up to
//!    `recall_n` candidate conversations. Skipped with `embeddings_only`,
//!    in which case the whole corpus is in scope. Conversation filters are
//!    then evaluated by the [`ConversationFilter`] collaborator.
//! 2. **Embedding rerank.** Embed the query once and score every chunk of
//!    the scoped conversations by cosine similarity, plus an optional
//!    recency boost. Sort by score (desc), then chunk id (asc).
//! 3. **Diversity rerank.** Maximal Marginal Relevance over the top
//!    `mmr_pool_cap` candidates:
//!    `final = λ · relevance − (1 − λ) · penalty`, where the penalty is
//!    `1.0` for a conversation already selected and otherwise the highest
//!    raw cosine similarity to any selected chunk (negative when every
//!    selected chunk points away; `0.0` for the first pick). While any unselected
//!    conversation remains in the pool, only its chunks are eligible.
//!
//! `λ = 1.0` or `diversity = false` returns the Stage 2 order unchanged.
//! For fixed inputs the output order is fully deterministic.

use std::collections::HashSet;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, warn};

use crate::corpus::{ConversationFilter, LexicalRecall, SearchFilters};
use crate::embedding::{cosine_similarity, embed_query, EmbeddingBackend};
use crate::error::{IndexError, SearchError};
use crate::models::{Chunk, IndexMeta, ScoreBreakdown, SearchResult};
use crate::store::IndexStore;

const SECONDS_PER_DAY: f32 = 86_400.0;

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    /// Conversations requested from lexical recall.
    pub recall_n: usize,
    /// Maximum results to return.
    pub limit: usize,
    /// Relevance weight in the MMR objective, in `[0, 1]`.
    pub lambda: f32,
    /// Run the diversity rerank at all.
    pub diversity: bool,
    /// Candidates passed into the quadratic MMR step.
    pub mmr_pool_cap: usize,
    /// Minimum raw similarity; applied before any rerank.
    pub threshold: Option<f32>,
    /// Recency boost weight; `0.0` disables it.
    pub recency_weight: f32,
    pub recency_half_life_days: f32,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            recall_n: 80,
            limit: 10,
            lambda: 0.7,
            diversity: true,
            mmr_pool_cap: 200,
            threshold: None,
            recency_weight: 0.0,
            recency_half_life_days: 30.0,
        }
    }
}

impl SearchParams {
    /// Reject parameter values no search can run with.
    pub fn validate(&self) -> std::result::Result<(), SearchError> {
        if !(0.0..=1.0).contains(&self.lambda) {
            return Err(SearchError::InvalidLambda(self.lambda));
        }
        Ok(())
    }
}

/// Reject a query with nothing to embed or match.
///
/// Callers run this before resolving a backend so an empty query never
/// reaches a model or a network service.
pub fn validate_query(query: &str) -> std::result::Result<(), SearchError> {
    if query.chars().any(char::is_alphanumeric) {
        Ok(())
    } else {
        Err(SearchError::EmptyQuery)
    }
}

/// Bundles all inputs for a single search invocation.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub query: &'a str,
    pub filters: &'a SearchFilters,
    /// Skip lexical recall and score the whole (filtered) corpus.
    pub embeddings_only: bool,
    pub params: SearchParams,
    /// Reference time for the recency boost (unix seconds).
    pub now: i64,
}

/// Ranked results plus scan diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    /// Stored chunks skipped because their vectors were unusable.
    pub malformed: usize,
    /// Chunks scored in Stage 2.
    pub candidates_scored: usize,
    /// Conversations returned by lexical recall (`None` when skipped).
    pub recalled_conversations: Option<usize>,
}

struct Candidate {
    result: SearchResult,
    vector: Vec<f32>,
}

/// Read-only search over an [`IndexStore`].
pub struct Retriever<'a> {
    store: &'a dyn IndexStore,
    backend: &'a dyn EmbeddingBackend,
    recall: &'a dyn LexicalRecall,
    filter: &'a dyn ConversationFilter,
}

impl<'a> Retriever<'a> {
    pub fn new(
        store: &'a dyn IndexStore,
        backend: &'a dyn EmbeddingBackend,
        recall: &'a dyn LexicalRecall,
        filter: &'a dyn ConversationFilter,
    ) -> Self {
        Self {
            store,
            backend,
            recall,
            filter,
        }
    }

    pub async fn search(&self, req: &SearchRequest<'_>) -> Result<SearchOutcome> {
        validate_query(req.query)?;
        let params = &req.params;
        params.validate()?;

        // Fail before recall and embedding when the index cannot match.
        let meta = self.store.read_active_meta().await?;
        self.check_index(meta.as_ref())?;

        let mut outcome = SearchOutcome::default();

        // Stage 1: lexical recall
        let recalled: Option<HashSet<String>> = if req.embeddings_only {
            None
        } else {
            let ids = self.recall.recall(req.query, params.recall_n).await?;
            outcome.recalled_conversations = Some(ids.len());
            if ids.is_empty() {
                debug!("lexical recall returned no conversations");
                return Ok(outcome);
            }
            Some(ids.into_iter().collect())
        };

        let scope = if req.filters.has_conversation_filters() {
            let allowed = self
                .filter
                .filter_conversations(recalled.as_ref(), req.filters)
                .await?;
            if allowed.is_empty() {
                return Ok(outcome);
            }
            Some(allowed)
        } else {
            recalled.clone()
        };

        // Stage 2: embedding rerank
        let query_vec = embed_query(self.backend, req.query).await?;
        let scan = self.store.load_chunks(scope.as_ref()).await?;
        // A rebuild may have been activated since the check above.
        self.check_index(scan.meta.as_ref())?;
        outcome.malformed = scan.malformed;
        if scan.malformed > 0 {
            warn!(malformed = scan.malformed, "skipped malformed chunk records");
        }

        let mut candidates: Vec<Candidate> = Vec::new();
        for chunk in scan.chunks {
            if let Some(role) = req.filters.role {
                if !chunk.role.admits(role) {
                    continue;
                }
            }
            outcome.candidates_scored += 1;
            let similarity = cosine_similarity(&query_vec, &chunk.vector);
            if params.threshold.is_some_and(|t| similarity < t) {
                continue;
            }
            let recency_boost = recency_boost(params, req.now, chunk.timestamp);
            let lexical_match = recalled
                .as_ref()
                .is_some_and(|ids| ids.contains(&chunk.conversation_id));
            candidates.push(candidate(chunk, similarity, recency_boost, lexical_match));
        }

        candidates.sort_by(|a, b| {
            b.result
                .score
                .pre_mmr_score
                .total_cmp(&a.result.score.pre_mmr_score)
                .then_with(|| a.result.chunk_id.cmp(&b.result.chunk_id))
        });

        // Stage 3: diversity rerank
        outcome.results = if params.diversity && params.lambda < 1.0 {
            candidates.truncate(params.mmr_pool_cap.max(params.limit));
            mmr_rerank(candidates, params.lambda, params.limit)
        } else {
            candidates
                .into_iter()
                .take(params.limit)
                .enumerate()
                .map(|(rank, c)| {
                    let mut result = c.result;
                    result.score.mmr_rank = rank;
                    result
                })
                .collect()
        };

        debug!(
            results = outcome.results.len(),
            scored = outcome.candidates_scored,
            "search finished"
        );
        Ok(outcome)
    }
}

impl Retriever<'_> {
    fn check_index(&self, meta: Option<&IndexMeta>) -> Result<()> {
        let meta = meta.ok_or(IndexError::NotBuilt)?;
        let current = self.backend.fingerprint();
        if meta.fingerprint() != current {
            return Err(IndexError::IncompatibleIndex {
                stored: meta.fingerprint(),
                current,
            }
            .into());
        }
        Ok(())
    }
}

fn candidate(chunk: Chunk, similarity: f32, recency_boost: f32, lexical_match: bool) -> Candidate {
    let pre_mmr_score = similarity + recency_boost;
    Candidate {
        result: SearchResult {
            chunk_id: chunk.id,
            conversation_id: chunk.conversation_id,
            role: chunk.role,
            exchange_ids: chunk.exchange_ids,
            text: chunk.text,
            timestamp: chunk.timestamp,
            lexical_match,
            score: ScoreBreakdown {
                similarity,
                recency_boost,
                pre_mmr_score,
                mmr_penalty: 0.0,
                mmr_rank: 0,
                final_score: pre_mmr_score,
            },
        },
        vector: chunk.vector,
    }
}

/// `weight · 0.5^(age_days / half_life)`; zero when disabled.
fn recency_boost(params: &SearchParams, now: i64, timestamp: i64) -> f32 {
    if params.recency_weight <= 0.0 || params.recency_half_life_days <= 0.0 {
        return 0.0;
    }
    let age_days = ((now - timestamp).max(0) as f32) / SECONDS_PER_DAY;
    params.recency_weight * 0.5f32.powf(age_days / params.recency_half_life_days)
}

/// Greedy MMR selection over a pool sorted by relevance.
fn mmr_rerank(mut pool: Vec<Candidate>, lambda: f32, limit: usize) -> Vec<SearchResult> {
    let mut selected: Vec<Candidate> = Vec::with_capacity(limit.min(pool.len()));
    let mut seen: HashSet<String> = HashSet::new();

    while selected.len() < limit && !pool.is_empty() {
        let fresh_left = pool
            .iter()
            .any(|c| !seen.contains(&c.result.conversation_id));

        let mut best: Option<(usize, f32, f32)> = None;
        for (i, c) in pool.iter().enumerate() {
            let repeat = seen.contains(&c.result.conversation_id);
            if repeat && fresh_left {
                continue;
            }
            let penalty = if repeat {
                1.0
            } else if selected.is_empty() {
                0.0
            } else {
                selected
                    .iter()
                    .map(|s| cosine_similarity(&c.vector, &s.vector))
                    .fold(f32::NEG_INFINITY, f32::max)
            };
            let score = lambda * c.result.score.pre_mmr_score - (1.0 - lambda) * penalty;
            // strict comparison keeps the earlier (higher-relevance, lower-id) candidate on ties
            if best.map_or(true, |(_, s, _)| score > s) {
                best = Some((i, score, penalty));
            }
        }

        let Some((i, score, penalty)) = best else {
            break;
        };
        let mut chosen = pool.remove(i);
        chosen.result.score.mmr_penalty = penalty;
        chosen.result.score.mmr_rank = selected.len();
        chosen.result.score.final_score = score;
        seen.insert(chosen.result.conversation_id.clone());
        selected.push(chosen);
    }

    selected.into_iter().map(|c| c.result).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkRole;

    fn cand(id: &str, conv: &str, score: f32, vector: Vec<f32>) -> Candidate {
        let chunk = Chunk {
            id: id.into(),
            conversation_id: conv.into(),
            role: ChunkRole::Exchange,
            exchange_ids: vec![],
            text: id.into(),
            token_count: 1,
            vector,
            timestamp: 0,
        };
        candidate(chunk, score, 0.0, false)
    }

    #[test]
    fn test_mmr_prefers_new_conversations() {
        let pool = vec![
            cand("1", "a", 0.95, vec![1.0, 0.0]),
            cand("2", "a", 0.94, vec![1.0, 0.0]),
            cand("3", "b", 0.50, vec![0.0, 1.0]),
        ];
        let out = mmr_rerank(pool, 0.7, 3);
        let ids: Vec<&str> = out.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3", "2"]);
        assert_eq!(out[2].score.mmr_penalty, 1.0);
        assert_eq!(out[1].score.mmr_rank, 1);
    }

    #[test]
    fn test_mmr_penalizes_cross_conversation_redundancy() {
        let pool = vec![
            cand("1", "a", 0.90, vec![1.0, 0.0]),
            cand("2", "b", 0.85, vec![1.0, 0.0]),
            cand("3", "c", 0.80, vec![0.0, 1.0]),
        ];
        let out = mmr_rerank(pool, 0.5, 2);
        let ids: Vec<&str> = out.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert!((out[0].score.final_score - 0.45).abs() < 1e-6);
    }

    #[test]
    fn test_mmr_penalty_keeps_negative_similarity() {
        let pool = vec![
            cand("1", "a", 0.90, vec![1.0, 0.0]),
            cand("2", "b", 0.50, vec![-1.0, 0.0]),
        ];
        let out = mmr_rerank(pool, 0.5, 2);
        assert_eq!(out[0].score.mmr_penalty, 0.0);
        assert!((out[1].score.mmr_penalty + 1.0).abs() < 1e-6);
        assert!((out[1].score.final_score - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_validate_query_and_params() {
        assert!(matches!(validate_query("  ?!  "), Err(SearchError::EmptyQuery)));
        assert!(validate_query("token refresh").is_ok());
        let bad = SearchParams {
            lambda: 1.5,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(SearchError::InvalidLambda(_))));
        assert!(SearchParams::default().validate().is_ok());
    }

    #[test]
    fn test_recency_boost_halves_per_half_life() {
        let params = SearchParams {
            recency_weight: 0.2,
            recency_half_life_days: 10.0,
            ..Default::default()
        };
        let now = 100 * 86_400;
        assert!((recency_boost(&params, now, now) - 0.2).abs() < 1e-6);
        assert!((recency_boost(&params, now, now - 10 * 86_400) - 0.1).abs() < 1e-6);
        assert_eq!(recency_boost(&SearchParams::default(), now, 0), 0.0);
    }
}
