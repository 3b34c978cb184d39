//! Collaborator seams onto the conversation corpus.
//!
//! The corpus (conversation text, metadata, the full-text engine) is owned
//! elsewhere; the indexer and retriever reach it only through these traits.

pub mod memory;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{ChunkRole, Conversation};

/// Read access to the full corpus, for indexing.
#[async_trait]
pub trait ConversationSource: Send + Sync {
    async fn conversations(&self) -> Result<Vec<Conversation>>;
}

/// Stage 1 candidate narrowing by vocabulary.
#[async_trait]
pub trait LexicalRecall: Send + Sync {
    /// Up to `limit` conversation ids matching the query's terms, best first.
    async fn recall(&self, query: &str, limit: usize) -> Result<Vec<String>>;
}

/// Conversation-level predicate evaluation.
#[async_trait]
pub trait ConversationFilter: Send + Sync {
    /// Conversations that satisfy `filters`, drawn from `candidates` or from
    /// the whole corpus when `candidates` is `None`.
    async fn filter_conversations(
        &self,
        candidates: Option<&HashSet<String>>,
        filters: &SearchFilters,
    ) -> Result<HashSet<String>>;
}

/// Narrowing applied to a search.
///
/// Every field except `role` is a conversation-level predicate; `role`
/// applies per chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchFilters {
    /// Substring of the workspace path.
    pub workspace: Option<String>,
    /// Substring of the model name.
    pub model: Option<String>,
    /// Inclusive lower bound on the conversation start (unix seconds).
    pub since: Option<i64>,
    /// Inclusive upper bound on the conversation start (unix seconds).
    pub until: Option<i64>,
    /// At least one of these tags.
    pub tags_any: Vec<String>,
    /// Every one of these tags.
    pub tags_all: Vec<String>,
    /// None of these tags.
    pub tags_exclude: Vec<String>,
    pub role: Option<ChunkRole>,
}

impl SearchFilters {
    /// Whether any conversation-level predicate is set.
    pub fn has_conversation_filters(&self) -> bool {
        self.workspace.is_some()
            || self.model.is_some()
            || self.since.is_some()
            || self.until.is_some()
            || !self.tags_any.is_empty()
            || !self.tags_all.is_empty()
            || !self.tags_exclude.is_empty()
    }

    /// Evaluate the conversation-level predicates against one conversation.
    pub fn matches(&self, conversation: &Conversation) -> bool {
        let contains = |field: &Option<String>, needle: &str| {
            field
                .as_deref()
                .map(|v| v.to_lowercase().contains(&needle.to_lowercase()))
                .unwrap_or(false)
        };
        if let Some(ws) = &self.workspace {
            if !contains(&conversation.workspace, ws) {
                return false;
            }
        }
        if let Some(model) = &self.model {
            if !contains(&conversation.model, model) {
                return false;
            }
        }
        if self.since.is_some_and(|since| conversation.started_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| conversation.started_at > until) {
            return false;
        }
        let has = |tag: &String| conversation.tags.iter().any(|t| t == tag);
        if !self.tags_any.is_empty() && !self.tags_any.iter().any(has) {
            return false;
        }
        if !self.tags_all.iter().all(has) {
            return false;
        }
        !self.tags_exclude.iter().any(has)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv() -> Conversation {
        Conversation {
            id: "c1".into(),
            workspace: Some("/home/me/Projects/Auth-Service".into()),
            model: Some("claude-sonnet".into()),
            tags: vec!["auth".into(), "bug".into()],
            started_at: 1_000,
            exchanges: Vec::new(),
        }
    }

    #[test]
    fn test_empty_filters_match_everything() {
        let f = SearchFilters::default();
        assert!(!f.has_conversation_filters());
        assert!(f.matches(&conv()));
    }

    #[test]
    fn test_role_is_not_a_conversation_filter() {
        let f = SearchFilters {
            role: Some(ChunkRole::User),
            ..Default::default()
        };
        assert!(!f.has_conversation_filters());
    }

    #[test]
    fn test_substring_and_dates() {
        let f = SearchFilters {
            workspace: Some("auth-service".into()),
            model: Some("sonnet".into()),
            since: Some(500),
            until: Some(1_000),
            ..Default::default()
        };
        assert!(f.matches(&conv()));
        let late = SearchFilters {
            since: Some(2_000),
            ..Default::default()
        };
        assert!(!late.matches(&conv()));
    }

    #[test]
    fn test_tag_sets() {
        let any = SearchFilters {
            tags_any: vec!["perf".into(), "bug".into()],
            ..Default::default()
        };
        assert!(any.matches(&conv()));
        let all = SearchFilters {
            tags_all: vec!["auth".into(), "perf".into()],
            ..Default::default()
        };
        assert!(!all.matches(&conv()));
        let exclude = SearchFilters {
            tags_exclude: vec!["bug".into()],
            ..Default::default()
        };
        assert!(!exclude.matches(&conv()));
    }
}
