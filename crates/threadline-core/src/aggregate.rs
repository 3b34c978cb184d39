//! Conversation-level views over ranked search results.
//!
//! All functions here are pure: they read a result list and never touch the
//! index. Scores are [`SearchResult::relevance`], which is unaffected by
//! diversity reranking.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::models::{ConversationScore, SearchResult};

/// Group results by conversation.
///
/// Output is sorted by max score (desc), then conversation id (asc). The
/// representative excerpt is the text of the highest-scoring chunk.
pub fn aggregate_by_conversation(results: &[SearchResult]) -> Vec<ConversationScore> {
    let mut groups: BTreeMap<&str, Vec<&SearchResult>> = BTreeMap::new();
    for r in results {
        groups.entry(r.conversation_id.as_str()).or_default().push(r);
    }

    let mut scores: Vec<ConversationScore> = groups
        .into_iter()
        .filter_map(|(conversation_id, members)| {
            let best = members.iter().copied().reduce(|a, b| {
                if b.relevance() > a.relevance()
                    || (b.relevance() == a.relevance() && b.chunk_id < a.chunk_id)
                {
                    b
                } else {
                    a
                }
            })?;
            let sum: f32 = members.iter().map(|r| r.relevance()).sum();
            Some(ConversationScore {
                conversation_id: conversation_id.to_string(),
                max_score: best.relevance(),
                mean_score: sum / members.len() as f32,
                chunk_count: members.len(),
                best_chunk_id: best.chunk_id.clone(),
                best_excerpt: best.text.clone(),
            })
        })
        .collect();

    scores.sort_by(|a, b| {
        b.max_score
            .total_cmp(&a.max_score)
            .then_with(|| a.conversation_id.cmp(&b.conversation_id))
    });
    scores
}

/// Earliest result, by source timestamp, whose score clears `threshold`.
///
/// Score rank is irrelevant except to break timestamp ties (higher score
/// first, then chunk id).
pub fn first_mention(results: &[SearchResult], threshold: f32) -> Option<&SearchResult> {
    results
        .iter()
        .filter(|r| r.relevance() >= threshold)
        .min_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| b.relevance().total_cmp(&a.relevance()))
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        })
}

/// Two-tier presentation of aggregated conversations.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NarrativePartition {
    /// Mean of the max scores; the cut point.
    pub cut: f32,
    /// Conversations at or above the cut, shown expanded.
    pub expanded: Vec<ConversationScore>,
    /// The rest, shown as a shortlist.
    pub shortlist: Vec<ConversationScore>,
}

/// Split aggregated scores at the mean of their max scores.
///
/// Input order is preserved within each tier.
pub fn narrative_partition(scores: &[ConversationScore]) -> NarrativePartition {
    if scores.is_empty() {
        return NarrativePartition::default();
    }
    let cut = scores.iter().map(|s| s.max_score).sum::<f32>() / scores.len() as f32;
    let (expanded, shortlist): (Vec<_>, Vec<_>) = scores.iter().cloned().partition(|s| s.max_score >= cut);
    NarrativePartition {
        cut,
        expanded,
        shortlist,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkRole, ScoreBreakdown};

    fn result(id: &str, conv: &str, score: f32, ts: i64) -> SearchResult {
        SearchResult {
            chunk_id: id.into(),
            conversation_id: conv.into(),
            role: ChunkRole::Exchange,
            exchange_ids: vec![],
            text: format!("text of {id}"),
            timestamp: ts,
            lexical_match: true,
            score: ScoreBreakdown {
                similarity: score,
                pre_mmr_score: score,
                final_score: score,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_aggregate_max_mean_count() {
        let results = vec![
            result("1", "c", 0.6, 0),
            result("2", "c", 0.8, 0),
            result("3", "c", 0.7, 0),
            result("4", "d", 0.9, 0),
        ];
        let agg = aggregate_by_conversation(&results);
        assert_eq!(agg.len(), 2);
        assert_eq!(agg[0].conversation_id, "d");
        let c = &agg[1];
        assert!((c.max_score - 0.8).abs() < 1e-6);
        assert!((c.mean_score - 0.7).abs() < 1e-6);
        assert_eq!(c.chunk_count, 3);
        assert_eq!(c.best_excerpt, "text of 2");
    }

    #[test]
    fn test_aggregate_ties_by_conversation_id() {
        let results = vec![result("1", "zeta", 0.5, 0), result("2", "alpha", 0.5, 0)];
        let agg = aggregate_by_conversation(&results);
        assert_eq!(agg[0].conversation_id, "alpha");
    }

    #[test]
    fn test_first_mention_ignores_rank() {
        let results = vec![
            result("late", "c", 0.99, 300),
            result("mid", "c", 0.95, 200),
            result("early", "c", 0.90, 100),
            result("too-weak", "c", 0.10, 50),
        ];
        assert_eq!(first_mention(&results, 0.5).unwrap().chunk_id, "early");
        assert!(first_mention(&results, 0.999).is_none());
    }

    #[test]
    fn test_first_mention_timestamp_tie() {
        let results = vec![result("b", "c", 0.7, 100), result("a", "c", 0.8, 100)];
        assert_eq!(first_mention(&results, 0.0).unwrap().chunk_id, "a");
    }

    #[test]
    fn test_narrative_partition_at_mean() {
        let results = vec![
            result("1", "a", 0.9, 0),
            result("2", "b", 0.5, 0),
            result("3", "c", 0.4, 0),
        ];
        let part = narrative_partition(&aggregate_by_conversation(&results));
        assert!((part.cut - 0.6).abs() < 1e-6);
        let expanded: Vec<&str> = part.expanded.iter().map(|s| s.conversation_id.as_str()).collect();
        assert_eq!(expanded, vec!["a"]);
        assert_eq!(part.shortlist.len(), 2);
    }

    #[test]
    fn test_narrative_partition_cut_is_inclusive() {
        let results = vec![result("1", "a", 0.5, 0), result("2", "b", 0.5, 0)];
        let part = narrative_partition(&aggregate_by_conversation(&results));
        assert_eq!(part.expanded.len(), 2);
        assert!(part.shortlist.is_empty());
    }

    #[test]
    fn test_narrative_partition_empty() {
        assert_eq!(narrative_partition(&[]), NarrativePartition::default());
    }
}
