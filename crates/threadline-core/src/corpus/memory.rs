//! In-memory corpus implementing all three collaborator traits.
//!
//! Lexical recall ranks conversations by how many distinct query terms
//! appear anywhere in their exchanges.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::Conversation;

use super::{ConversationFilter, ConversationSource, LexicalRecall, SearchFilters};

#[derive(Debug, Clone, Default)]
pub struct InMemoryCorpus {
    conversations: Vec<Conversation>,
}

impl InMemoryCorpus {
    pub fn new(conversations: Vec<Conversation>) -> Self {
        Self { conversations }
    }

    pub fn push(&mut self, conversation: Conversation) {
        self.conversations.push(conversation);
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

#[async_trait]
impl ConversationSource for InMemoryCorpus {
    async fn conversations(&self) -> Result<Vec<Conversation>> {
        Ok(self.conversations.clone())
    }
}

#[async_trait]
impl LexicalRecall for InMemoryCorpus {
    async fn recall(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }
        let mut scored: Vec<(usize, &str)> = self
            .conversations
            .iter()
            .filter_map(|conv| {
                let vocab: HashSet<String> = conv
                    .exchanges
                    .iter()
                    .flat_map(|e| terms(&e.prompt).into_iter().chain(terms(&e.response)))
                    .collect();
                let hits = query_terms.iter().filter(|t| vocab.contains(*t)).count();
                (hits > 0).then_some((hits, conv.id.as_str()))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, id)| id.to_string())
            .collect())
    }
}

#[async_trait]
impl ConversationFilter for InMemoryCorpus {
    async fn filter_conversations(
        &self,
        candidates: Option<&HashSet<String>>,
        filters: &SearchFilters,
    ) -> Result<HashSet<String>> {
        Ok(self
            .conversations
            .iter()
            .filter(|c| candidates.map_or(true, |set| set.contains(&c.id)))
            .filter(|c| filters.matches(c))
            .map(|c| c.id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Exchange;

    fn conv(id: &str, text: &str, tags: &[&str]) -> Conversation {
        Conversation {
            id: id.into(),
            workspace: None,
            model: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            started_at: 0,
            exchanges: vec![Exchange {
                id: format!("{id}-1"),
                prompt: text.into(),
                response: "ok".into(),
                timestamp: 0,
            }],
        }
    }

    #[tokio::test]
    async fn test_recall_ranks_by_term_hits() {
        let corpus = InMemoryCorpus::new(vec![
            conv("a", "token expired", &[]),
            conv("b", "token refresh failing", &[]),
            conv("c", "bread recipe", &[]),
        ]);
        let ids = corpus.recall("Token refresh", 10).await.unwrap();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(corpus.recall("token", 1).await.unwrap().len(), 1);
        assert!(corpus.recall("   ", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_filter_within_candidates() {
        let corpus = InMemoryCorpus::new(vec![
            conv("a", "x", &["auth"]),
            conv("b", "y", &["auth"]),
            conv("c", "z", &[]),
        ]);
        let filters = SearchFilters {
            tags_any: vec!["auth".into()],
            ..Default::default()
        };
        let all = corpus.filter_conversations(None, &filters).await.unwrap();
        assert_eq!(all.len(), 2);
        let scope: HashSet<String> = ["b".to_string(), "c".to_string()].into_iter().collect();
        let scoped = corpus
            .filter_conversations(Some(&scope), &filters)
            .await
            .unwrap();
        assert_eq!(scoped, ["b".to_string()].into_iter().collect());
    }
}
