//! In-memory [`IndexStore`] implementation for tests and embedding.
//!
//! All state sits behind a single `std::sync::RwLock`, so every trait call
//! is atomic with respect to every other, which is the same guarantee the
//! SQLite store gets from transactions.

use std::collections::{BTreeMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tracing::warn;

use crate::models::{Chunk, IndexMeta};

use super::{ChunkScan, IndexStore};

struct Generation {
    meta: IndexMeta,
    active: bool,
    chunks: Vec<Chunk>,
}

#[derive(Default)]
struct State {
    generations: BTreeMap<i64, Generation>,
    next_generation: i64,
}

impl State {
    fn active(&self) -> Option<&Generation> {
        self.generations.values().find(|g| g.active)
    }
}

/// In-memory vector index.
#[derive(Default)]
pub struct InMemoryIndexStore {
    state: RwLock<State>,
}

impl InMemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| anyhow!("in-memory index lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| anyhow!("in-memory index lock poisoned"))
    }
}

#[async_trait]
impl IndexStore for InMemoryIndexStore {
    async fn read_active_meta(&self) -> Result<Option<IndexMeta>> {
        Ok(self.read()?.active().map(|g| g.meta.clone()))
    }

    async fn create_generation(&self, meta: &IndexMeta) -> Result<i64> {
        let mut state = self.write()?;
        state.next_generation += 1;
        let generation = state.next_generation;
        let mut meta = meta.clone();
        meta.generation = generation;
        state.generations.insert(
            generation,
            Generation {
                meta,
                active: false,
                chunks: Vec::new(),
            },
        );
        Ok(generation)
    }

    async fn write_batch(&self, generation: i64, chunks: &[Chunk], meta: &IndexMeta) -> Result<()> {
        let mut state = self.write()?;
        let Some(gen) = state.generations.get_mut(&generation) else {
            bail!("unknown index generation {}", generation);
        };
        gen.chunks.extend_from_slice(chunks);
        gen.meta = IndexMeta {
            generation,
            ..meta.clone()
        };
        Ok(())
    }

    async fn activate_generation(&self, generation: i64) -> Result<()> {
        let mut state = self.write()?;
        if !state.generations.contains_key(&generation) {
            bail!("unknown index generation {}", generation);
        }
        state.generations.retain(|&g, _| g == generation);
        if let Some(gen) = state.generations.get_mut(&generation) {
            gen.active = true;
        }
        Ok(())
    }

    async fn discard_staging(&self) -> Result<u64> {
        let mut state = self.write()?;
        let before = state.generations.len();
        state.generations.retain(|_, g| g.active);
        Ok((before - state.generations.len()) as u64)
    }

    async fn indexed_exchange_ids(&self) -> Result<HashSet<String>> {
        let state = self.read()?;
        Ok(state
            .active()
            .map(|g| {
                g.chunks
                    .iter()
                    .flat_map(|c| c.exchange_ids.iter().cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn token_counts(&self) -> Result<Vec<usize>> {
        let state = self.read()?;
        Ok(state
            .active()
            .map(|g| g.chunks.iter().map(|c| c.token_count).collect())
            .unwrap_or_default())
    }

    async fn chunk_count(&self) -> Result<usize> {
        Ok(self.read()?.active().map(|g| g.chunks.len()).unwrap_or(0))
    }

    async fn load_chunks(&self, conversations: Option<&HashSet<String>>) -> Result<ChunkScan> {
        let state = self.read()?;
        let Some(active) = state.active() else {
            return Ok(ChunkScan::default());
        };
        let mut scan = ChunkScan {
            meta: Some(active.meta.clone()),
            ..Default::default()
        };
        for chunk in &active.chunks {
            if let Some(scope) = conversations {
                if !scope.contains(&chunk.conversation_id) {
                    continue;
                }
            }
            let finite = chunk.vector.iter().all(|v| v.is_finite());
            if chunk.vector.len() != active.meta.dims || !finite {
                warn!(chunk_id = %chunk.id, "skipping chunk with malformed vector");
                scan.malformed += 1;
                continue;
            }
            scan.chunks.push(chunk.clone());
        }
        Ok(scan)
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<u64> {
        let mut state = self.write()?;
        let mut removed = 0u64;
        for gen in state.generations.values_mut() {
            let before = gen.chunks.len();
            gen.chunks.retain(|c| c.conversation_id != conversation_id);
            removed += (before - gen.chunks.len()) as u64;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkRole, TokenStats, SCHEMA_VERSION};

    fn meta(dims: usize) -> IndexMeta {
        IndexMeta {
            schema_version: SCHEMA_VERSION,
            backend: "hash".into(),
            model: "bow".into(),
            dims,
            max_seq_len: 512,
            built_at: 0,
            token_stats: TokenStats::default(),
            split_exchanges: 0,
            truncations: 0,
            generation: 0,
        }
    }

    fn chunk(id: &str, conv: &str, vector: Vec<f32>) -> Chunk {
        Chunk {
            id: id.into(),
            conversation_id: conv.into(),
            role: ChunkRole::Exchange,
            exchange_ids: vec![format!("{id}-x")],
            text: "text".into(),
            token_count: 1,
            vector,
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn test_staging_is_invisible_until_activated() {
        let store = InMemoryIndexStore::new();
        let gen = store.create_generation(&meta(2)).await.unwrap();
        store
            .write_batch(gen, &[chunk("a", "c1", vec![1.0, 0.0])], &meta(2))
            .await
            .unwrap();
        assert!(store.read_active_meta().await.unwrap().is_none());
        assert_eq!(store.chunk_count().await.unwrap(), 0);

        store.activate_generation(gen).await.unwrap();
        let active = store.read_active_meta().await.unwrap().unwrap();
        assert_eq!(active.generation, gen);
        assert_eq!(store.chunk_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_activation_replaces_previous_generation() {
        let store = InMemoryIndexStore::new();
        let first = store.create_generation(&meta(2)).await.unwrap();
        store
            .write_batch(first, &[chunk("a", "c1", vec![1.0, 0.0])], &meta(2))
            .await
            .unwrap();
        store.activate_generation(first).await.unwrap();

        let second = store.create_generation(&meta(3)).await.unwrap();
        store
            .write_batch(second, &[chunk("b", "c2", vec![0.0, 1.0, 0.0])], &meta(3))
            .await
            .unwrap();
        // still the old index while staging
        assert_eq!(store.read_active_meta().await.unwrap().unwrap().dims, 2);
        store.activate_generation(second).await.unwrap();

        let ids = store.indexed_exchange_ids().await.unwrap();
        assert!(ids.contains("b-x"));
        assert!(!ids.contains("a-x"));
        assert_eq!(store.discard_staging().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_load_chunks_skips_malformed_and_scopes() {
        let store = InMemoryIndexStore::new();
        let gen = store.create_generation(&meta(2)).await.unwrap();
        let chunks = vec![
            chunk("a", "c1", vec![1.0, 0.0]),
            chunk("b", "c1", vec![1.0]),
            chunk("c", "c2", vec![0.0, 1.0]),
        ];
        store.write_batch(gen, &chunks, &meta(2)).await.unwrap();
        store.activate_generation(gen).await.unwrap();

        let all = store.load_chunks(None).await.unwrap();
        assert_eq!(all.chunks.len(), 2);
        assert_eq!(all.malformed, 1);
        assert_eq!(all.meta.unwrap().generation, gen);

        let scope: HashSet<String> = ["c2".to_string()].into_iter().collect();
        let scoped = store.load_chunks(Some(&scope)).await.unwrap();
        assert_eq!(scoped.chunks.len(), 1);
        assert_eq!(scoped.chunks[0].id, "c");
    }

    #[tokio::test]
    async fn test_discard_staging_and_delete_conversation() {
        let store = InMemoryIndexStore::new();
        let gen = store.create_generation(&meta(2)).await.unwrap();
        store
            .write_batch(gen, &[chunk("a", "c1", vec![1.0, 0.0])], &meta(2))
            .await
            .unwrap();
        store.activate_generation(gen).await.unwrap();
        store.create_generation(&meta(2)).await.unwrap();
        assert_eq!(store.discard_staging().await.unwrap(), 1);

        assert_eq!(store.delete_conversation("c1").await.unwrap(), 1);
        assert_eq!(store.chunk_count().await.unwrap(), 0);
    }
}
