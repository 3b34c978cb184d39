//! SQLite connection management.
//!
//! Two ways in:
//!
//! - [`connect_writer`] creates the database if needed, checks the stored
//!   schema version and brings the schema up to date. It uses the rollback
//!   (`DELETE`) journal, so the database never depends on `-wal`/`-shm`
//!   side files.
//! - [`connect_reader`] opens an existing database with `read_only(true)`.
//!   It never migrates, never sets a journal mode and never writes, so
//!   search works against read-only media.

use anyhow::{bail, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::debug;

use threadline_core::error::IndexError;
use threadline_core::models::SCHEMA_VERSION;

use crate::config::Config;
use crate::migrate;

/// Open the database for writing, creating and migrating it as needed.
///
/// Fails with [`IndexError::SchemaMismatch`] before any write when the
/// file was created by an incompatible schema version.
pub async fn connect_writer(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete);

    // One connection: a single writer never contends with itself.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    let found = schema_version(&pool).await?;
    if found != 0 && found != SCHEMA_VERSION {
        pool.close().await;
        return Err(IndexError::SchemaMismatch {
            found,
            expected: SCHEMA_VERSION,
        }
        .into());
    }

    migrate::apply(&pool).await?;
    debug!(path = %db_path.display(), "opened database for writing");
    Ok(pool)
}

/// Open an existing database strictly for reading.
pub async fn connect_reader(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;
    if !db_path.exists() {
        bail!(
            "Database not found at {}. Run `threadline init` first.",
            db_path.display()
        );
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .read_only(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    let found = schema_version(&pool).await?;
    if found == 0 {
        pool.close().await;
        bail!(
            "Database at {} has no schema. Run `threadline init` first.",
            db_path.display()
        );
    }
    if found != SCHEMA_VERSION {
        pool.close().await;
        return Err(IndexError::SchemaMismatch {
            found,
            expected: SCHEMA_VERSION,
        }
        .into());
    }

    debug!(path = %db_path.display(), "opened database read-only");
    Ok(pool)
}

/// `PRAGMA user_version`; zero for a database with no schema yet.
pub async fn schema_version(pool: &SqlitePool) -> Result<u32> {
    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await?;
    Ok(u32::try_from(version).unwrap_or(u32::MAX))
}
