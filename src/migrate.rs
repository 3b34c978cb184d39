//! Schema migrations.
//!
//! The corpus side (`conversations`, `exchanges`, `exchanges_fts`) holds
//! imported conversation text; the index side (`index_meta`, `chunks`)
//! holds build generations of embedded chunks. `PRAGMA user_version`
//! records the schema version and is only stamped here.

use anyhow::Result;
use sqlx::SqlitePool;

use threadline_core::models::SCHEMA_VERSION;

use crate::config::Config;
use crate::db;

/// `threadline init`: create the database and bring its schema up to date.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect_writer(config).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index that does not exist yet. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            workspace TEXT,
            model TEXT,
            tags_json TEXT NOT NULL DEFAULT '[]',
            started_at INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            imported_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS exchanges (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            prompt TEXT NOT NULL,
            response TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            UNIQUE(conversation_id, seq),
            FOREIGN KEY (conversation_id) REFERENCES conversations(id)
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='exchanges_fts'",
    )
    .fetch_one(&mut *tx)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE exchanges_fts USING fts5(
                exchange_id UNINDEXED,
                conversation_id UNINDEXED,
                text
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_meta (
            generation INTEGER PRIMARY KEY AUTOINCREMENT,
            active INTEGER NOT NULL DEFAULT 0,
            schema_version INTEGER NOT NULL,
            backend TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            max_seq_len INTEGER NOT NULL,
            built_at INTEGER NOT NULL,
            token_stats_json TEXT NOT NULL DEFAULT '{}',
            split_exchanges INTEGER NOT NULL DEFAULT 0,
            truncations INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT NOT NULL,
            generation INTEGER NOT NULL,
            conversation_id TEXT NOT NULL,
            role TEXT NOT NULL,
            exchange_ids_json TEXT NOT NULL,
            text TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            vector BLOB NOT NULL,
            timestamp INTEGER NOT NULL,
            PRIMARY KEY (generation, id),
            FOREIGN KEY (generation) REFERENCES index_meta(generation)
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_exchanges_conversation ON exchanges(conversation_id, seq)",
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_generation_conversation ON chunks(generation, conversation_id)",
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_conversation ON chunks(conversation_id)")
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_conversations_started_at ON conversations(started_at)",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}
