//! Storage abstraction for the vector index.
//!
//! The [`IndexStore`] trait is everything the indexer and retriever need
//! from persistence. Chunks live in numbered build *generations*; exactly
//! one generation is active at a time and readers only ever see it.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`read_active_meta`](IndexStore::read_active_meta) | Metadata of the active generation |
//! | [`create_generation`](IndexStore::create_generation) | Open a staging generation for a rebuild |
//! | [`write_batch`](IndexStore::write_batch) | Chunks + metadata, one transaction |
//! | [`activate_generation`](IndexStore::activate_generation) | Swap a staged generation in, drop the rest |
//! | [`discard_staging`](IndexStore::discard_staging) | Remove unactivated generations |
//! | [`load_chunks`](IndexStore::load_chunks) | Active metadata + chunks in one snapshot, skipping malformed rows |
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Chunk, IndexMeta};

/// Result of scanning stored chunks.
///
/// `meta` and `chunks` come from one consistent read of the store, so the
/// chunks always belong to the generation `meta` describes.
#[derive(Debug, Default)]
pub struct ChunkScan {
    /// Active generation the chunks were read from; `None` before any build.
    pub meta: Option<IndexMeta>,
    /// Chunks whose vectors decoded to the index dimension.
    pub chunks: Vec<Chunk>,
    /// Rows skipped because their vector was corrupt or the wrong length.
    pub malformed: usize,
}

#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Metadata of the active generation, if any index has been built.
    async fn read_active_meta(&self) -> Result<Option<IndexMeta>>;

    /// Create an inactive generation described by `meta`; returns its number.
    async fn create_generation(&self, meta: &IndexMeta) -> Result<i64>;

    /// Append chunks to `generation` and replace its metadata, atomically.
    async fn write_batch(&self, generation: i64, chunks: &[Chunk], meta: &IndexMeta) -> Result<()>;

    /// Make `generation` the active one and delete every other generation,
    /// atomically.
    async fn activate_generation(&self, generation: i64) -> Result<()>;

    /// Delete generations that were created but never activated.
    ///
    /// Returns the number of generations removed.
    async fn discard_staging(&self) -> Result<u64>;

    /// Exchange ids covered by chunks of the active generation.
    async fn indexed_exchange_ids(&self) -> Result<HashSet<String>>;

    /// Token counts of every chunk in the active generation.
    async fn token_counts(&self) -> Result<Vec<usize>>;

    /// Number of chunks in the active generation.
    async fn chunk_count(&self) -> Result<usize>;

    /// Load active chunks, optionally restricted to a set of conversations,
    /// together with the metadata of the generation they were read from.
    async fn load_chunks(&self, conversations: Option<&HashSet<String>>) -> Result<ChunkScan>;

    /// Delete every chunk of a conversation, in all generations.
    async fn delete_conversation(&self, conversation_id: &str) -> Result<u64>;
}
