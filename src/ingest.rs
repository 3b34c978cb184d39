//! Conversation import.
//!
//! Reads normalized conversation records from JSONL (one conversation per
//! line) and stores them in the corpus tables. A directory is walked for
//! `*.jsonl` files in path order. Each conversation is written in its own
//! transaction together with its FTS rows; a conversation whose content
//! hash is unchanged is skipped, and a changed one has its indexed chunks
//! dropped so the next `index build` re-embeds it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use threadline_core::models::{Conversation, Exchange};

use crate::config::Config;
use crate::db;
use crate::lock::IndexLock;
use crate::sqlite_store::delete_conversation_chunks;

/// A JSONL line that could not be turned into a conversation.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("{path}:{line}: invalid conversation record: {source}")]
    InvalidRecord {
        path: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path}:{line}: conversation record has an empty id")]
    MissingId { path: String, line: usize },
}

/// Wire shape of one JSONL line. Exchange ids and timestamps are optional.
#[derive(Debug, Deserialize)]
struct ConversationRecord {
    id: String,
    #[serde(default)]
    workspace: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    started_at: Option<i64>,
    #[serde(default)]
    exchanges: Vec<ExchangeRecord>,
}

#[derive(Debug, Deserialize)]
struct ExchangeRecord {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    response: String,
    #[serde(default)]
    timestamp: Option<i64>,
}

impl ConversationRecord {
    fn into_conversation(self) -> Conversation {
        let first_ts = self.exchanges.iter().find_map(|e| e.timestamp);
        let started_at = self.started_at.or(first_ts).unwrap_or(0);
        let conversation_id = self.id;
        let mut last_ts = started_at;
        let exchanges = self
            .exchanges
            .into_iter()
            .enumerate()
            .map(|(seq, e)| {
                let timestamp = e.timestamp.unwrap_or(last_ts);
                last_ts = timestamp;
                Exchange {
                    id: e
                        .id
                        .unwrap_or_else(|| derived_exchange_id(&conversation_id, seq)),
                    prompt: e.prompt,
                    response: e.response,
                    timestamp,
                }
            })
            .collect();
        Conversation {
            id: conversation_id,
            workspace: self.workspace,
            model: self.model,
            tags: self.tags,
            started_at,
            exchanges,
        }
    }
}

/// Stable id for an exchange that arrived without one.
fn derived_exchange_id(conversation_id: &str, seq: usize) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("threadline:{}:{}", conversation_id, seq).as_bytes(),
    )
    .to_string()
}

/// SHA-256 over the normalized conversation.
fn content_hash(conversation: &Conversation) -> Result<String> {
    let canonical = serde_json::to_vec(conversation)?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Outcome of storing one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Parse one JSONL file into conversations, collecting bad lines.
pub fn read_jsonl(path: &Path) -> Result<(Vec<Conversation>, Vec<ImportError>)> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut conversations = Vec::new();
    let mut errors = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let line_no = idx + 1;
        match serde_json::from_str::<ConversationRecord>(line) {
            Ok(record) if record.id.trim().is_empty() => errors.push(ImportError::MissingId {
                path: path.display().to_string(),
                line: line_no,
            }),
            Ok(record) => conversations.push(record.into_conversation()),
            Err(source) => errors.push(ImportError::InvalidRecord {
                path: path.display().to_string(),
                line: line_no,
                source,
            }),
        }
    }
    Ok((conversations, errors))
}

/// `*.jsonl` files under `path` (or `path` itself), sorted.
fn discover_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        anyhow::bail!("Import path does not exist: {}", path.display());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry?;
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|ext| ext == "jsonl")
        {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Upsert one conversation with its exchanges and FTS rows, atomically.
pub async fn store_conversation(pool: &SqlitePool, conversation: &Conversation) -> Result<StoreOutcome> {
    let hash = content_hash(conversation)?;
    let existing: Option<String> =
        sqlx::query_scalar("SELECT content_hash FROM conversations WHERE id = ?")
            .bind(&conversation.id)
            .fetch_optional(pool)
            .await?;
    if existing.as_deref() == Some(hash.as_str()) {
        return Ok(StoreOutcome::Unchanged);
    }

    let mut tx = pool.begin().await?;

    if existing.is_some() {
        sqlx::query("DELETE FROM exchanges_fts WHERE conversation_id = ?")
            .bind(&conversation.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM exchanges WHERE conversation_id = ?")
            .bind(&conversation.id)
            .execute(&mut *tx)
            .await?;
        let dropped = delete_conversation_chunks(&mut tx, &conversation.id).await?;
        debug!(conversation = %conversation.id, dropped, "conversation changed; dropped its chunks");
    }

    sqlx::query(
        r#"
        INSERT INTO conversations (id, workspace, model, tags_json, started_at, content_hash, imported_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            workspace = excluded.workspace,
            model = excluded.model,
            tags_json = excluded.tags_json,
            started_at = excluded.started_at,
            content_hash = excluded.content_hash,
            imported_at = excluded.imported_at
        "#,
    )
    .bind(&conversation.id)
    .bind(&conversation.workspace)
    .bind(&conversation.model)
    .bind(serde_json::to_string(&conversation.tags)?)
    .bind(conversation.started_at)
    .bind(&hash)
    .bind(chrono::Utc::now().timestamp())
    .execute(&mut *tx)
    .await?;

    for (seq, exchange) in conversation.exchanges.iter().enumerate() {
        sqlx::query(
            "INSERT INTO exchanges (id, conversation_id, seq, prompt, response, timestamp) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&exchange.id)
        .bind(&conversation.id)
        .bind(seq as i64)
        .bind(&exchange.prompt)
        .bind(&exchange.response)
        .bind(exchange.timestamp)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO exchanges_fts (exchange_id, conversation_id, text) VALUES (?, ?, ?)")
            .bind(&exchange.id)
            .bind(&conversation.id)
            .bind(format!("{}\n\n{}", exchange.prompt, exchange.response))
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(if existing.is_some() {
        StoreOutcome::Updated
    } else {
        StoreOutcome::Inserted
    })
}

/// Totals reported by [`run_import`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub files: usize,
    pub read: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub rejected: usize,
}

/// Import every conversation found at `path`.
///
/// Holds the index build lock, since changed conversations drop chunks.
pub async fn import_path(config: &Config, path: &Path) -> Result<ImportSummary> {
    let files = discover_files(path)?;
    let _lock = IndexLock::try_acquire(&config.db.lock_path())?;
    let pool = db::connect_writer(config).await?;

    let mut summary = ImportSummary {
        files: files.len(),
        ..Default::default()
    };

    for file in &files {
        let (conversations, errors) = read_jsonl(file)?;
        for err in &errors {
            warn!(error = %err, "skipping record");
        }
        summary.rejected += errors.len();
        summary.read += conversations.len();

        for conversation in &conversations {
            match store_conversation(&pool, conversation).await? {
                StoreOutcome::Inserted => summary.inserted += 1,
                StoreOutcome::Updated => summary.updated += 1,
                StoreOutcome::Unchanged => summary.unchanged += 1,
            }
        }
        info!(file = %file.display(), conversations = conversations.len(), "imported file");
    }

    pool.close().await;
    Ok(summary)
}

/// `threadline import <path>`.
pub async fn run_import(config: &Config, path: &Path) -> Result<()> {
    let summary = import_path(config, path).await?;

    println!("import {}", path.display());
    println!("  files: {}", summary.files);
    println!("  conversations read: {}", summary.read);
    println!("  inserted: {}", summary.inserted);
    println!("  updated: {}", summary.updated);
    println!("  unchanged: {}", summary.unchanged);
    if summary.rejected > 0 {
        println!("  rejected records: {}", summary.rejected);
    }
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LINE_A: &str = r#"{"id":"a","workspace":"/src/app","tags":["auth"],"exchanges":[{"prompt":"why does refresh fail","response":"clock skew","timestamp":1700000000},{"prompt":"fix?","response":"sync ntp"}]}"#;

    #[test]
    fn test_record_defaults() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("a.jsonl");
        std::fs::write(&file, format!("{LINE_A}\n\nnot json\n{{\"id\":\"\"}}\n")).unwrap();

        let (convs, errors) = read_jsonl(&file).unwrap();
        assert_eq!(convs.len(), 1);
        assert_eq!(errors.len(), 2);
        assert!(matches!(errors[0], ImportError::InvalidRecord { line: 3, .. }));
        assert!(matches!(errors[1], ImportError::MissingId { line: 4, .. }));

        let conv = &convs[0];
        assert_eq!(conv.started_at, 1_700_000_000);
        // Missing timestamps inherit the previous exchange's.
        assert_eq!(conv.exchanges[1].timestamp, 1_700_000_000);
        assert_eq!(conv.exchanges[0].id, derived_exchange_id("a", 0));
        assert_ne!(conv.exchanges[0].id, conv.exchanges[1].id);
    }

    #[tokio::test]
    async fn test_reimport_skips_unchanged_and_replaces_changed() {
        let tmp = TempDir::new().unwrap();
        let config = Config::minimal(tmp.path().join("t.sqlite"));
        let dir = tmp.path().join("logs");
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("one.jsonl"), format!("{LINE_A}\n")).unwrap();
        std::fs::write(
            dir.join("nested/two.jsonl"),
            r#"{"id":"b","started_at":5,"exchanges":[{"id":"b1","prompt":"hi","response":"hello"}]}"#,
        )
        .unwrap();
        std::fs::write(dir.join("ignored.txt"), "{}").unwrap();

        let first = import_path(&config, &dir).await.unwrap();
        assert_eq!(first.files, 2);
        assert_eq!(first.inserted, 2);

        let second = import_path(&config, &dir).await.unwrap();
        assert_eq!(second.unchanged, 2);
        assert_eq!(second.inserted, 0);

        std::fs::write(
            dir.join("nested/two.jsonl"),
            r#"{"id":"b","started_at":5,"exchanges":[{"id":"b1","prompt":"hi again","response":"hello"}]}"#,
        )
        .unwrap();
        let third = import_path(&config, &dir).await.unwrap();
        assert_eq!(third.updated, 1);
        assert_eq!(third.unchanged, 1);

        let pool = db::connect_reader(&config).await.unwrap();
        let prompts: Vec<String> =
            sqlx::query_scalar("SELECT prompt FROM exchanges WHERE conversation_id = 'b'")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(prompts, vec!["hi again"]);
        let fts_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM exchanges_fts WHERE conversation_id = 'b'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(fts_rows, 1);
    }
}
