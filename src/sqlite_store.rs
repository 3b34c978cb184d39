//! SQLite-backed implementations of the core storage and corpus traits.
//!
//! [`SqliteIndexStore`] persists build generations of embedded chunks.
//! [`SqliteCorpus`] serves imported conversations, FTS5 lexical recall and
//! conversation filters.
//!
//! A store opened with [`SqliteIndexStore::reader`] refuses every write
//! with [`IndexError::ReadOnlyViolation`] before touching the database.

use std::collections::HashSet;

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::warn;

use threadline_core::corpus::{ConversationFilter, ConversationSource, LexicalRecall, SearchFilters};
use threadline_core::embedding::{blob_to_vec, vec_to_blob};
use threadline_core::error::IndexError;
use threadline_core::models::{Chunk, ChunkRole, Conversation, Exchange, IndexMeta, TokenStats};
use threadline_core::store::{ChunkScan, IndexStore};

/// SQLite implementation of [`IndexStore`].
pub struct SqliteIndexStore {
    pool: SqlitePool,
    read_only: bool,
}

impl SqliteIndexStore {
    /// Store that accepts writes. Pair with [`crate::db::connect_writer`].
    pub fn writer(pool: SqlitePool) -> Self {
        Self {
            pool,
            read_only: false,
        }
    }

    /// Store that rejects every write. Pair with [`crate::db::connect_reader`].
    pub fn reader(pool: SqlitePool) -> Self {
        Self {
            pool,
            read_only: true,
        }
    }

    fn ensure_writable(&self, operation: &str) -> Result<()> {
        if self.read_only {
            return Err(IndexError::ReadOnlyViolation {
                operation: operation.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

fn meta_from_row(row: &SqliteRow) -> Result<IndexMeta> {
    let stats_json: String = row.try_get("token_stats_json")?;
    let token_stats: TokenStats = serde_json::from_str(&stats_json).unwrap_or_else(|e| {
        warn!(error = %e, "unreadable token stats in index_meta");
        TokenStats::default()
    });
    Ok(IndexMeta {
        schema_version: row.try_get::<i64, _>("schema_version")? as u32,
        backend: row.try_get("backend")?,
        model: row.try_get("model")?,
        dims: row.try_get::<i64, _>("dims")? as usize,
        max_seq_len: row.try_get::<i64, _>("max_seq_len")? as usize,
        built_at: row.try_get("built_at")?,
        token_stats,
        split_exchanges: row.try_get::<i64, _>("split_exchanges")? as u64,
        truncations: row.try_get::<i64, _>("truncations")? as u64,
        generation: row.try_get("generation")?,
    })
}

/// Decode one stored chunk; `None` when the row is corrupt.
fn chunk_from_row(row: &SqliteRow, dims: usize) -> Option<Chunk> {
    let id: String = row.try_get("id").ok()?;
    let blob: Vec<u8> = row.try_get("vector").ok()?;
    let vector = match blob_to_vec(&blob) {
        Some(v) if v.len() == dims => v,
        Some(v) => {
            warn!(chunk_id = %id, got = v.len(), expected = dims, "stored vector has the wrong dimension");
            return None;
        }
        None => {
            warn!(chunk_id = %id, bytes = blob.len(), "stored vector is corrupt");
            return None;
        }
    };
    let role: ChunkRole = match row.try_get::<String, _>("role").ok()?.parse() {
        Ok(role) => role,
        Err(e) => {
            warn!(chunk_id = %id, error = %e, "stored chunk has an unknown role");
            return None;
        }
    };
    let exchange_ids_json: String = row.try_get("exchange_ids_json").ok()?;
    let exchange_ids: Vec<String> = match serde_json::from_str(&exchange_ids_json) {
        Ok(ids) => ids,
        Err(e) => {
            warn!(chunk_id = %id, error = %e, "stored chunk has unreadable exchange ids");
            return None;
        }
    };
    Some(Chunk {
        id,
        conversation_id: row.try_get("conversation_id").ok()?,
        role,
        exchange_ids,
        text: row.try_get("text").ok()?,
        token_count: row.try_get::<i64, _>("token_count").ok()? as usize,
        vector,
        timestamp: row.try_get("timestamp").ok()?,
    })
}

/// Delete a conversation's chunks from every generation.
///
/// Shared with the importer so a changed conversation's stale chunks go in
/// the same transaction as its new text.
pub async fn delete_conversation_chunks(
    conn: &mut SqliteConnection,
    conversation_id: &str,
) -> Result<u64> {
    let result = sqlx::query("DELETE FROM chunks WHERE conversation_id = ?")
        .bind(conversation_id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

async fn active_meta(conn: &mut SqliteConnection) -> Result<Option<IndexMeta>> {
    let row = sqlx::query("SELECT * FROM index_meta WHERE active = 1 ORDER BY generation DESC LIMIT 1")
        .fetch_optional(conn)
        .await?;
    row.as_ref().map(meta_from_row).transpose()
}

#[async_trait]
impl IndexStore for SqliteIndexStore {
    async fn read_active_meta(&self) -> Result<Option<IndexMeta>> {
        let mut conn = self.pool.acquire().await?;
        active_meta(&mut conn).await
    }

    async fn create_generation(&self, meta: &IndexMeta) -> Result<i64> {
        self.ensure_writable("create an index generation")?;
        let stats_json = serde_json::to_string(&meta.token_stats)?;
        let result = sqlx::query(
            r#"
            INSERT INTO index_meta (active, schema_version, backend, model, dims, max_seq_len,
                                    built_at, token_stats_json, split_exchanges, truncations)
            VALUES (0, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(meta.schema_version as i64)
        .bind(&meta.backend)
        .bind(&meta.model)
        .bind(meta.dims as i64)
        .bind(meta.max_seq_len as i64)
        .bind(meta.built_at)
        .bind(&stats_json)
        .bind(meta.split_exchanges as i64)
        .bind(meta.truncations as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn write_batch(&self, generation: i64, chunks: &[Chunk], meta: &IndexMeta) -> Result<()> {
        self.ensure_writable("write index chunks")?;
        let stats_json = serde_json::to_string(&meta.token_stats)?;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE index_meta SET
                built_at = ?,
                token_stats_json = ?,
                split_exchanges = ?,
                truncations = ?
            WHERE generation = ?
            "#,
        )
        .bind(meta.built_at)
        .bind(&stats_json)
        .bind(meta.split_exchanges as i64)
        .bind(meta.truncations as i64)
        .bind(generation)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() != 1 {
            bail!("unknown index generation {}", generation);
        }

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, generation, conversation_id, role, exchange_ids_json,
                                    text, token_count, vector, timestamp)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(generation)
            .bind(&chunk.conversation_id)
            .bind(chunk.role.as_str())
            .bind(serde_json::to_string(&chunk.exchange_ids)?)
            .bind(&chunk.text)
            .bind(chunk.token_count as i64)
            .bind(vec_to_blob(&chunk.vector))
            .bind(chunk.timestamp)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn activate_generation(&self, generation: i64) -> Result<()> {
        self.ensure_writable("activate an index generation")?;
        let mut tx = self.pool.begin().await?;

        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM index_meta WHERE generation = ?")
                .bind(generation)
                .fetch_one(&mut *tx)
                .await?;
        if !exists {
            bail!("unknown index generation {}", generation);
        }

        sqlx::query("DELETE FROM chunks WHERE generation != ?")
            .bind(generation)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM index_meta WHERE generation != ?")
            .bind(generation)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE index_meta SET active = 1 WHERE generation = ?")
            .bind(generation)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn discard_staging(&self) -> Result<u64> {
        self.ensure_writable("discard staging generations")?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM chunks WHERE generation IN (SELECT generation FROM index_meta WHERE active = 0)",
        )
        .execute(&mut *tx)
        .await?;
        let removed = sqlx::query("DELETE FROM index_meta WHERE active = 0")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed)
    }

    async fn indexed_exchange_ids(&self) -> Result<HashSet<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT c.exchange_ids_json
            FROM chunks c
            JOIN index_meta m ON m.generation = c.generation
            WHERE m.active = 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut ids = HashSet::new();
        for json in rows {
            match serde_json::from_str::<Vec<String>>(&json) {
                Ok(list) => ids.extend(list),
                Err(e) => warn!(error = %e, "skipping unreadable exchange id list"),
            }
        }
        Ok(ids)
    }

    async fn token_counts(&self) -> Result<Vec<usize>> {
        let counts: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT c.token_count
            FROM chunks c
            JOIN index_meta m ON m.generation = c.generation
            WHERE m.active = 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(counts.into_iter().map(|c| c.max(0) as usize).collect())
    }

    async fn chunk_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM chunks c
            JOIN index_meta m ON m.generation = c.generation
            WHERE m.active = 1
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn load_chunks(&self, conversations: Option<&HashSet<String>>) -> Result<ChunkScan> {
        if conversations.is_some_and(|set| set.is_empty()) {
            return Ok(ChunkScan {
                meta: self.read_active_meta().await?,
                ..Default::default()
            });
        }

        // One read transaction: an activation committed mid-scan cannot
        // pair one generation's meta with another's rows.
        let mut tx = self.pool.begin().await?;
        let Some(meta) = active_meta(&mut tx).await? else {
            tx.rollback().await?;
            return Ok(ChunkScan::default());
        };

        let rows = match conversations {
            Some(set) => {
                let mut ids: Vec<&String> = set.iter().collect();
                ids.sort();
                sqlx::query(
                    r#"
                    SELECT * FROM chunks
                    WHERE generation = ?
                      AND conversation_id IN (SELECT value FROM json_each(?))
                    "#,
                )
                .bind(meta.generation)
                .bind(serde_json::to_string(&ids)?)
                .fetch_all(&mut *tx)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM chunks WHERE generation = ?")
                    .bind(meta.generation)
                    .fetch_all(&mut *tx)
                    .await?
            }
        };
        tx.rollback().await?;

        let mut scan = ChunkScan::default();
        for row in &rows {
            match chunk_from_row(row, meta.dims) {
                Some(chunk) => scan.chunks.push(chunk),
                None => scan.malformed += 1,
            }
        }
        if scan.malformed > 0 {
            warn!(malformed = scan.malformed, "skipped malformed chunk rows");
        }
        scan.meta = Some(meta);
        Ok(scan)
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<u64> {
        self.ensure_writable("delete conversation chunks")?;
        let mut conn = self.pool.acquire().await?;
        delete_conversation_chunks(&mut conn, conversation_id).await
    }
}

/// SQLite-backed corpus: conversations, FTS5 recall and filters.
pub struct SqliteCorpus {
    pool: SqlitePool,
}

impl SqliteCorpus {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Conversation metadata only, without exchanges.
    async fn headers(&self) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT id, workspace, model, tags_json, started_at FROM conversations ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(header_from_row).collect()
    }
}

fn header_from_row(row: &SqliteRow) -> Result<Conversation> {
    let tags_json: String = row.try_get("tags_json")?;
    Ok(Conversation {
        id: row.try_get("id")?,
        workspace: row.try_get("workspace")?,
        model: row.try_get("model")?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        started_at: row.try_get("started_at")?,
        exchanges: Vec::new(),
    })
}

/// Turn free text into an FTS5 query: every word quoted, OR-joined.
///
/// Returns `None` when the text has no searchable words.
pub fn fts_query(text: &str) -> Option<String> {
    let mut seen = HashSet::new();
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .filter(|w| seen.insert(w.clone()))
        .map(|w| format!("\"{}\"", w))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

#[async_trait]
impl ConversationSource for SqliteCorpus {
    async fn conversations(&self) -> Result<Vec<Conversation>> {
        let mut conversations = self.headers().await?;
        let rows = sqlx::query(
            "SELECT id, conversation_id, prompt, response, timestamp FROM exchanges ORDER BY conversation_id, seq",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_conversation: std::collections::HashMap<String, Vec<Exchange>> =
            std::collections::HashMap::new();
        for row in &rows {
            let conversation_id: String = row.try_get("conversation_id")?;
            by_conversation
                .entry(conversation_id)
                .or_default()
                .push(Exchange {
                    id: row.try_get("id")?,
                    prompt: row.try_get("prompt")?,
                    response: row.try_get("response")?,
                    timestamp: row.try_get("timestamp")?,
                });
        }
        for conv in &mut conversations {
            conv.exchanges = by_conversation.remove(&conv.id).unwrap_or_default();
        }
        Ok(conversations)
    }
}

#[async_trait]
impl LexicalRecall for SqliteCorpus {
    async fn recall(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let Some(fts) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT conversation_id FROM (
                SELECT conversation_id, bm25(exchanges_fts) AS score
                FROM exchanges_fts
                WHERE exchanges_fts MATCH ?
            )
            GROUP BY conversation_id
            ORDER BY MIN(score), conversation_id
            LIMIT ?
            "#,
        )
        .bind(&fts)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

#[async_trait]
impl ConversationFilter for SqliteCorpus {
    async fn filter_conversations(
        &self,
        candidates: Option<&HashSet<String>>,
        filters: &SearchFilters,
    ) -> Result<HashSet<String>> {
        Ok(self
            .headers()
            .await?
            .into_iter()
            .filter(|c| candidates.map_or(true, |set| set.contains(&c.id)))
            .filter(|c| filters.matches(c))
            .map(|c| c.id)
            .collect())
    }
}
