//! Vector index builder.
//!
//! The [`Indexer`] chunks conversations, embeds the chunks in bounded
//! batches and writes them through an [`IndexStore`]. It owns the
//! compatibility state machine:
//!
//! - no active index → first build into a fresh generation;
//! - active index, same (backend, model, dims) → incremental append;
//! - active index, different fingerprint → [`IndexError::IncompatibleIndex`]
//!   unless a rebuild was asked for, in which case a staging generation is
//!   filled and swapped in at the end.
//!
//! Each written batch carries its chunks and the refreshed [`IndexMeta`]
//! in one store call, which the store commits atomically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::chunk::{chunk_conversation, ChunkingParams};
use crate::corpus::ConversationSource;
use crate::embedding::{embed_checked, EmbeddingBackend};
use crate::error::IndexError;
use crate::models::{Chunk, Conversation, Exchange, IndexMeta, TokenStats, SCHEMA_VERSION};
use crate::store::IndexStore;

/// Cooperative cancellation, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives progress after each committed batch.
pub trait BuildObserver: Send + Sync {
    fn batch_committed(&self, conversations_done: usize, conversations_total: usize, chunks_written: usize);
}

impl BuildObserver for () {
    fn batch_committed(&self, _: usize, _: usize, _: usize) {}
}

/// Tunables for [`Indexer`].
#[derive(Debug, Clone, Copy)]
pub struct IndexerConfig {
    pub chunking: ChunkingParams,
    /// Texts per embedding call.
    pub batch_size: usize,
    /// Hard cap on chunks written by one build.
    pub max_chunks_per_build: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingParams::default(),
            batch_size: 32,
            max_chunks_per_build: 200_000,
        }
    }
}

/// Outcome of a build or incremental add.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildReport {
    /// True when a new generation replaced (or became) the active index.
    pub rebuilt: bool,
    pub chunks_added: usize,
    /// Chunks in the active index after the operation.
    pub total_chunks: usize,
    /// Fragments cut at a raw token boundary during this operation.
    pub truncation_count: u64,
    /// Exchanges that needed recursive splitting during this operation.
    pub split_exchanges: u64,
    pub conversations_indexed: usize,
    /// Token-length distribution of the whole active index.
    pub token_stats: TokenStats,
    /// Stopped at `max_chunks_per_build`.
    pub capped: bool,
    pub cancelled: bool,
}

/// Running counters of one build.
#[derive(Default)]
struct Run {
    token_counts: Vec<usize>,
    chunks_added: usize,
    split_exchanges: u64,
    truncations: u64,
    conversations_indexed: usize,
    capped: bool,
    cancelled: bool,
}

pub struct Indexer<'a> {
    store: &'a dyn IndexStore,
    backend: &'a dyn EmbeddingBackend,
    config: IndexerConfig,
    cancel: CancelFlag,
    observer: &'a dyn BuildObserver,
}

impl<'a> Indexer<'a> {
    pub fn new(store: &'a dyn IndexStore, backend: &'a dyn EmbeddingBackend, config: IndexerConfig) -> Self {
        Self {
            store,
            backend,
            config,
            cancel: CancelFlag::new(),
            observer: &(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_observer(mut self, observer: &'a dyn BuildObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Build the index from the whole corpus.
    ///
    /// With `rebuild == false` and an active index present, this is an
    /// incremental add of whatever the corpus holds that is not yet indexed.
    pub async fn build(&self, source: &dyn ConversationSource, rebuild: bool) -> Result<BuildReport> {
        let conversations = source.conversations().await?;
        let active = self.store.read_active_meta().await?;
        match active {
            Some(_) if !rebuild => self.add_incremental(&conversations).await,
            _ => self.full_build(&conversations).await,
        }
    }

    /// Append chunks for exchanges that are not in the index yet.
    ///
    /// Rejects the call without touching the store when the active index
    /// was built with a different backend fingerprint. On an empty store
    /// this performs the first build.
    pub async fn add_incremental(&self, conversations: &[Conversation]) -> Result<BuildReport> {
        let Some(mut meta) = self.store.read_active_meta().await? else {
            return self.full_build(conversations).await;
        };
        self.check_compatible(&meta)?;
        self.store.discard_staging().await?;

        let known = self.store.indexed_exchange_ids().await?;
        let pending: Vec<(&str, Vec<Exchange>)> = conversations
            .iter()
            .filter_map(|conv| {
                let fresh: Vec<Exchange> = conv
                    .exchanges
                    .iter()
                    .filter(|e| !known.contains(&e.id))
                    .cloned()
                    .collect();
                (!fresh.is_empty()).then_some((conv.id.as_str(), fresh))
            })
            .collect();
        debug!(conversations = pending.len(), "incremental add");

        let mut run = Run {
            token_counts: self.store.token_counts().await?,
            ..Default::default()
        };
        let seeded_split = meta.split_exchanges;
        let seeded_trunc = meta.truncations;
        let params = self.config.chunking.fit_to_model(meta.max_seq_len);
        let generation = meta.generation;

        self.run_batches(generation, &pending, params, &mut meta, &mut run, seeded_split, seeded_trunc)
            .await?;

        let report = self.report(false, run).await?;
        info!(
            chunks_added = report.chunks_added,
            total_chunks = report.total_chunks,
            "incremental index update finished"
        );
        Ok(report)
    }

    async fn full_build(&self, conversations: &[Conversation]) -> Result<BuildReport> {
        let discarded = self.store.discard_staging().await?;
        if discarded > 0 {
            warn!(discarded, "discarded unfinished index generations");
        }

        let params = self.config.chunking.fit_to_model(self.backend.max_seq_len());
        let mut meta = IndexMeta {
            schema_version: SCHEMA_VERSION,
            backend: self.backend.name().to_string(),
            model: self.backend.model_name().to_string(),
            dims: self.backend.dims(),
            max_seq_len: self.backend.max_seq_len(),
            built_at: chrono::Utc::now().timestamp(),
            token_stats: TokenStats::default(),
            split_exchanges: 0,
            truncations: 0,
            generation: 0,
        };
        let generation = self.store.create_generation(&meta).await?;
        meta.generation = generation;
        info!(generation, fingerprint = %meta.fingerprint(), "starting full index build");

        let pending: Vec<(&str, Vec<Exchange>)> = conversations
            .iter()
            .filter(|c| !c.exchanges.is_empty())
            .map(|c| (c.id.as_str(), c.exchanges.clone()))
            .collect();

        let mut run = Run::default();
        let result = self
            .run_batches(generation, &pending, params, &mut meta, &mut run, 0, 0)
            .await;

        if let Err(e) = result {
            self.store.discard_staging().await?;
            return Err(e);
        }
        if run.cancelled {
            self.store.discard_staging().await?;
            run.chunks_added = 0;
            warn!(generation, "index build cancelled; previous index left in place");
            return self.report(false, run).await;
        }

        self.store.activate_generation(generation).await?;
        if run.capped {
            warn!(
                max_chunks = self.config.max_chunks_per_build,
                "index build stopped at the chunk cap; activated a partial index"
            );
        }
        let report = self.report(true, run).await?;
        info!(
            chunks = report.total_chunks,
            truncations = report.truncation_count,
            split_exchanges = report.split_exchanges,
            "index build finished"
        );
        Ok(report)
    }

    fn check_compatible(&self, meta: &IndexMeta) -> Result<()> {
        if meta.schema_version != SCHEMA_VERSION {
            return Err(IndexError::SchemaMismatch {
                found: meta.schema_version,
                expected: SCHEMA_VERSION,
            }
            .into());
        }
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

    #[allow(clippy::too_many_arguments)]
    async fn run_batches(
        &self,
        generation: i64,
        pending: &[(&str, Vec<Exchange>)],
        params: ChunkingParams,
        meta: &mut IndexMeta,
        run: &mut Run,
        seeded_split: u64,
        seeded_trunc: u64,
    ) -> Result<()> {
        let counter = self.backend.token_counter().await?;
        let cap = self.config.max_chunks_per_build;
        let mut batch: Vec<Chunk> = Vec::new();

        for (done, (conversation_id, exchanges)) in pending.iter().enumerate() {
            if self.cancel.is_cancelled() {
                run.cancelled = true;
                return Ok(());
            }

            let chunked = chunk_conversation(conversation_id, exchanges, &params, counter.as_ref());
            run.split_exchanges += chunked.split_exchanges;
            run.truncations += chunked.truncations;
            run.conversations_indexed += 1;

            let room = cap.saturating_sub(run.chunks_added + batch.len());
            let mut chunks = chunked.chunks;
            if chunks.len() > room {
                truncate_at_exchange_boundary(&mut chunks, room);
                run.capped = true;
            }
            batch.extend(chunks);

            if run.capped || batch.len() >= self.config.batch_size {
                meta.split_exchanges = seeded_split + run.split_exchanges;
                meta.truncations = seeded_trunc + run.truncations;
                self.commit(generation, &mut batch, meta, run).await?;
                self.observer
                    .batch_committed(done + 1, pending.len(), run.chunks_added);
            }
            if run.capped {
                return Ok(());
            }
        }

        if self.cancel.is_cancelled() {
            run.cancelled = true;
            return Ok(());
        }
        meta.split_exchanges = seeded_split + run.split_exchanges;
        meta.truncations = seeded_trunc + run.truncations;
        if !batch.is_empty() {
            self.commit(generation, &mut batch, meta, run).await?;
            self.observer
                .batch_committed(pending.len(), pending.len(), run.chunks_added);
        }
        Ok(())
    }

    /// Embed `batch` in bounded calls and write it with the updated meta.
    async fn commit(
        &self,
        generation: i64,
        batch: &mut Vec<Chunk>,
        meta: &mut IndexMeta,
        run: &mut Run,
    ) -> Result<()> {
        for slice in batch.chunks_mut(self.config.batch_size.max(1)) {
            let texts: Vec<String> = slice.iter().map(|c| c.text.clone()).collect();
            let vectors = embed_checked(self.backend, &texts).await?;
            for (chunk, vector) in slice.iter_mut().zip(vectors) {
                chunk.vector = vector;
            }
        }

        run.token_counts.extend(batch.iter().map(|c| c.token_count));
        meta.token_stats = TokenStats::from_counts(&run.token_counts);
        meta.built_at = chrono::Utc::now().timestamp();

        self.store.write_batch(generation, batch, meta).await?;
        run.chunks_added += batch.len();
        debug!(generation, written = batch.len(), total = run.chunks_added, "committed batch");
        batch.clear();
        Ok(())
    }

    async fn report(&self, rebuilt: bool, run: Run) -> Result<BuildReport> {
        let total_chunks = self.store.chunk_count().await?;
        let token_stats = TokenStats::from_counts(&self.store.token_counts().await?);
        Ok(BuildReport {
            rebuilt,
            chunks_added: run.chunks_added,
            total_chunks,
            truncation_count: run.truncations,
            split_exchanges: run.split_exchanges,
            conversations_indexed: run.conversations_indexed,
            token_stats,
            capped: run.capped,
            cancelled: run.cancelled,
        })
    }
}

/// Keep at most `room` chunks without splitting an exchange.
///
/// Fragments of one oversized exchange share its id; keeping only some of
/// them would mark the exchange indexed and lose the rest for good.
fn truncate_at_exchange_boundary(chunks: &mut Vec<Chunk>, room: usize) {
    if chunks.len() <= room {
        return;
    }
    let mut keep = room;
    while keep > 0 {
        let first_dropped = &chunks[keep];
        let shares_exchange = chunks[keep - 1]
            .exchange_ids
            .iter()
            .any(|id| first_dropped.exchange_ids.contains(id));
        if !shares_exchange {
            break;
        }
        keep -= 1;
    }
    chunks.truncate(keep);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::memory::InMemoryCorpus;
    use crate::store::memory::InMemoryIndexStore;
    use crate::testing::HashingBackend;

    fn conv(id: &str, n: usize, base_ts: i64) -> Conversation {
        Conversation {
            id: id.into(),
            workspace: None,
            model: None,
            tags: Vec::new(),
            started_at: base_ts,
            exchanges: (0..n)
                .map(|i| Exchange {
                    id: format!("{id}-{i}"),
                    prompt: format!("question {i} about {id}"),
                    response: format!("answer {i} for {id}"),
                    timestamp: base_ts + i as i64,
                })
                .collect(),
        }
    }

    fn small_config() -> IndexerConfig {
        IndexerConfig {
            chunking: ChunkingParams {
                target_tokens: 10,
                max_tokens: 20,
                overlap_tokens: 0,
            },
            batch_size: 2,
            max_chunks_per_build: 1_000,
        }
    }

    #[tokio::test]
    async fn test_first_build_activates() {
        let store = InMemoryIndexStore::new();
        let backend = HashingBackend::new("hash", "bow", 32);
        let corpus = InMemoryCorpus::new(vec![conv("a", 3, 100), conv("b", 2, 200)]);
        let report = Indexer::new(&store, &backend, small_config())
            .build(&corpus, false)
            .await
            .unwrap();
        assert!(report.rebuilt);
        assert_eq!(report.chunks_added, 5);
        assert_eq!(report.total_chunks, 5);
        assert_eq!(report.conversations_indexed, 2);
        let meta = store.read_active_meta().await.unwrap().unwrap();
        assert_eq!(meta.dims, 32);
        assert_eq!(meta.token_stats.count, 5);
    }

    #[tokio::test]
    async fn test_incremental_appends_only_new_exchanges() {
        let store = InMemoryIndexStore::new();
        let backend = HashingBackend::new("hash", "bow", 32);
        let indexer = Indexer::new(&store, &backend, small_config());
        indexer.add_incremental(&[conv("a", 2, 100)]).await.unwrap();

        let report = indexer
            .add_incremental(&[conv("a", 4, 100), conv("b", 1, 300)])
            .await
            .unwrap();
        assert!(!report.rebuilt);
        assert_eq!(report.chunks_added, 3);
        assert_eq!(report.total_chunks, 5);
        assert_eq!(store.read_active_meta().await.unwrap().unwrap().token_stats.count, 5);

        let again = indexer.add_incremental(&[conv("a", 4, 100)]).await.unwrap();
        assert_eq!(again.chunks_added, 0);
    }

    #[tokio::test]
    async fn test_cap_activates_partial_build() {
        let store = InMemoryIndexStore::new();
        let backend = HashingBackend::new("hash", "bow", 32);
        let config = IndexerConfig {
            max_chunks_per_build: 3,
            ..small_config()
        };
        let corpus = InMemoryCorpus::new(vec![conv("a", 2, 100), conv("b", 2, 200), conv("c", 2, 300)]);
        let report = Indexer::new(&store, &backend, config)
            .build(&corpus, true)
            .await
            .unwrap();
        assert!(report.capped);
        assert_eq!(report.total_chunks, 3);
        assert!(store.read_active_meta().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cap_never_splits_an_exchange() {
        let long = "word ".repeat(60);
        let mut conversation = conv("a", 1, 100);
        conversation.exchanges.push(Exchange {
            id: "a-big".into(),
            prompt: long.clone(),
            response: long,
            timestamp: 200,
        });
        let backend = HashingBackend::new("hash", "bow", 32);

        let reference = InMemoryIndexStore::new();
        let uncapped = Indexer::new(&reference, &backend, small_config())
            .add_incremental(std::slice::from_ref(&conversation))
            .await
            .unwrap();
        assert!(uncapped.chunks_added > 3);

        let store = InMemoryIndexStore::new();
        let capped_config = IndexerConfig {
            max_chunks_per_build: 2,
            ..small_config()
        };
        let report = Indexer::new(&store, &backend, capped_config)
            .add_incremental(std::slice::from_ref(&conversation))
            .await
            .unwrap();
        assert!(report.capped);
        assert_eq!(report.total_chunks, 1);
        let ids = store.indexed_exchange_ids().await.unwrap();
        assert!(ids.contains("a-0"));
        assert!(!ids.contains("a-big"));

        let resumed = Indexer::new(&store, &backend, small_config())
            .add_incremental(std::slice::from_ref(&conversation))
            .await
            .unwrap();
        assert_eq!(resumed.total_chunks, uncapped.total_chunks);
        assert!(store.indexed_exchange_ids().await.unwrap().contains("a-big"));
    }

    #[test]
    fn test_truncate_at_exchange_boundary() {
        let chunk = |ids: &[&str]| Chunk {
            id: ids.join("+"),
            conversation_id: "c".into(),
            role: crate::models::ChunkRole::User,
            exchange_ids: ids.iter().map(|s| s.to_string()).collect(),
            text: "t".into(),
            token_count: 1,
            vector: Vec::new(),
            timestamp: 0,
        };
        let mut chunks = vec![chunk(&["e1", "e2"]), chunk(&["e3"]), chunk(&["e3"]), chunk(&["e4"])];
        truncate_at_exchange_boundary(&mut chunks, 2);
        assert_eq!(chunks.len(), 1);

        let mut chunks = vec![chunk(&["e1"]), chunk(&["e2"]), chunk(&["e3"])];
        truncate_at_exchange_boundary(&mut chunks, 2);
        assert_eq!(chunks.len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_rebuild_keeps_previous_index() {
        let store = InMemoryIndexStore::new();
        let old = HashingBackend::new("hash", "bow", 32);
        let corpus = InMemoryCorpus::new(vec![conv("a", 2, 100)]);
        Indexer::new(&store, &old, small_config())
            .build(&corpus, false)
            .await
            .unwrap();

        let new = HashingBackend::new("hash", "bow-v2", 64);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let report = Indexer::new(&store, &new, small_config())
            .with_cancel(cancel)
            .build(&corpus, true)
            .await
            .unwrap();
        assert!(report.cancelled);
        let meta = store.read_active_meta().await.unwrap().unwrap();
        assert_eq!(meta.model, "bow");
        assert_eq!(store.chunk_count().await.unwrap(), 2);
        assert_eq!(store.discard_staging().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rebuild_switches_backend() {
        let store = InMemoryIndexStore::new();
        let corpus = InMemoryCorpus::new(vec![conv("a", 2, 100)]);
        let old = HashingBackend::new("hash", "bow", 32);
        Indexer::new(&store, &old, small_config())
            .build(&corpus, false)
            .await
            .unwrap();

        let new = HashingBackend::new("other", "bow", 16);
        let report = Indexer::new(&store, &new, small_config())
            .build(&corpus, true)
            .await
            .unwrap();
        assert!(report.rebuilt);
        assert_eq!(report.total_chunks, 2);
        let meta = store.read_active_meta().await.unwrap().unwrap();
        assert_eq!(meta.backend, "other");
        assert_eq!(meta.dims, 16);
    }
}
