//! `threadline index build` and `threadline index status`.
//!
//! A build takes the single-writer lock, resolves the embedding backend and
//! runs the core [`Indexer`] against the SQLite store and corpus. Ctrl-C
//! requests a cooperative stop after the batch in flight; a stopped rebuild
//! never replaces the active index.

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use threadline_core::index::{BuildReport, CancelFlag, Indexer};
use threadline_core::models::IndexMeta;
use threadline_core::store::IndexStore;

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::lock::IndexLock;
use crate::progress::{format_number, ProgressMode};
use crate::sqlite_store::{SqliteCorpus, SqliteIndexStore};

/// Build or extend the vector index and return the report.
pub async fn build_index(
    config: &Config,
    rebuild: bool,
    backend: Option<&str>,
    progress: ProgressMode,
) -> Result<BuildReport> {
    let _lock = IndexLock::try_acquire(&config.db.lock_path())?;
    let pool = db::connect_writer(config).await?;

    let backend = embedding::resolve(config, backend).await?;
    let store = SqliteIndexStore::writer(pool.clone());
    let corpus = SqliteCorpus::new(pool.clone());
    let observer = progress.observer();

    let cancel = CancelFlag::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; stopping after the current batch");
                cancel.cancel();
            }
        })
    };

    info!(
        backend = backend.name(),
        model = backend.model_name(),
        rebuild,
        "starting index build"
    );
    let result = Indexer::new(&store, backend.as_ref(), config.indexer_config())
        .with_cancel(cancel)
        .with_observer(observer.as_ref())
        .build(&corpus, rebuild)
        .await;

    interrupt.abort();
    pool.close().await;
    result
}

/// `threadline index build`.
pub async fn run_build(
    config: &Config,
    rebuild: bool,
    backend: Option<&str>,
    progress: ProgressMode,
    json: bool,
) -> Result<()> {
    let report = build_index(config, rebuild, backend, progress).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("index build{}", if report.rebuilt { " (rebuild)" } else { "" });
    println!("  conversations indexed: {}", format_number(report.conversations_indexed as u64));
    println!("  chunks added: {}", format_number(report.chunks_added as u64));
    println!("  total chunks: {}", format_number(report.total_chunks as u64));
    println!("  split exchanges: {}", report.split_exchanges);
    println!("  truncations: {}", report.truncation_count);
    print_token_stats(&report.token_stats);
    if report.capped {
        println!(
            "  capped at {} chunks (index.max_chunks_per_build); run again to continue",
            format_number(config.index.max_chunks_per_build as u64)
        );
    }
    if report.cancelled {
        println!("cancelled");
    } else {
        println!("ok");
    }
    Ok(())
}

fn print_token_stats(stats: &threadline_core::models::TokenStats) {
    if stats.count == 0 {
        return;
    }
    println!(
        "  tokens/chunk: min {}  mean {:.1}  p50 {}  p95 {}  max {}",
        stats.min, stats.mean, stats.p50, stats.p95, stats.max
    );
}

/// Snapshot printed by `threadline index status`.
#[derive(Debug, Serialize)]
pub struct IndexStatus {
    pub db_path: String,
    pub conversations: i64,
    pub exchanges: i64,
    pub chunks: usize,
    pub meta: Option<IndexMeta>,
}

/// Read the index state without writing anything.
pub async fn index_status(config: &Config) -> Result<IndexStatus> {
    let pool = db::connect_reader(config).await?;
    let store = SqliteIndexStore::reader(pool.clone());

    let meta = store.read_active_meta().await?;
    let chunks = store.chunk_count().await?;
    let (conversations, exchanges) = corpus_counts(&pool).await?;

    pool.close().await;
    Ok(IndexStatus {
        db_path: config.db.path.display().to_string(),
        conversations,
        exchanges,
        chunks,
        meta,
    })
}

async fn corpus_counts(pool: &SqlitePool) -> Result<(i64, i64)> {
    let conversations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversations")
        .fetch_one(pool)
        .await?;
    let exchanges: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM exchanges")
        .fetch_one(pool)
        .await?;
    Ok((conversations, exchanges))
}

/// `threadline index status`.
pub async fn run_status(config: &Config, json: bool) -> Result<()> {
    let status = index_status(config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("index status");
    println!("  database: {}", status.db_path);
    println!("  conversations: {}", format_number(status.conversations as u64));
    println!("  exchanges: {}", format_number(status.exchanges as u64));

    let Some(meta) = &status.meta else {
        println!("  index: not built (run `threadline index build`)");
        return Ok(());
    };

    let built = chrono::DateTime::from_timestamp(meta.built_at, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_default();
    println!("  backend: {} / {} ({} dims)", meta.backend, meta.model, meta.dims);
    println!("  max sequence length: {}", meta.max_seq_len);
    println!("  schema version: {}", meta.schema_version);
    println!("  generation: {}", meta.generation);
    println!("  built at: {}", built);
    println!("  chunks: {}", format_number(status.chunks as u64));
    println!("  split exchanges: {}", meta.split_exchanges);
    println!("  truncations: {}", meta.truncations);
    print_token_stats(&meta.token_stats);
    Ok(())
}
