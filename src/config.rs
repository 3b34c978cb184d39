//! Configuration parsing and validation.
//!
//! threadline is configured with a single TOML file (default
//! `./config/threadline.toml`). Every section except `[db]` is optional and
//! falls back to the defaults below.
//!
//! ```toml
//! [db]
//! path = "./data/threadline.sqlite"
//!
//! [chunking]
//! target_tokens = 256
//! max_tokens = 384
//! overlap_tokens = 32
//!
//! [index]
//! batch_size = 32
//! max_chunks_per_build = 200000
//!
//! [retrieval]
//! recall_n = 80
//! limit = 10
//! lambda = 0.7
//!
//! [embedding]
//! preference = ["local", "ollama"]
//! model = "all-minilm-l6-v2"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use threadline_core::chunk::ChunkingParams;
use threadline_core::index::IndexerConfig;
use threadline_core::search::SearchParams;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

impl DbConfig {
    /// Advisory lock file guarding index builds against this database.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_tokens")]
    pub target_tokens: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: default_target_tokens(),
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_target_tokens() -> usize {
    256
}
fn default_max_tokens() -> usize {
    384
}
fn default_overlap() -> usize {
    32
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_chunks_per_build")]
    pub max_chunks_per_build: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_chunks_per_build: default_max_chunks_per_build(),
        }
    }
}

fn default_batch_size() -> usize {
    32
}
fn default_max_chunks_per_build() -> usize {
    200_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_recall_n")]
    pub recall_n: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_lambda")]
    pub lambda: f32,
    #[serde(default = "default_true")]
    pub diversity: bool,
    #[serde(default = "default_mmr_pool_cap")]
    pub mmr_pool_cap: usize,
    #[serde(default)]
    pub threshold: Option<f32>,
    #[serde(default)]
    pub recency_weight: f32,
    #[serde(default = "default_half_life")]
    pub recency_half_life_days: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            recall_n: default_recall_n(),
            limit: default_limit(),
            lambda: default_lambda(),
            diversity: true,
            mmr_pool_cap: default_mmr_pool_cap(),
            threshold: None,
            recency_weight: 0.0,
            recency_half_life_days: default_half_life(),
        }
    }
}

fn default_recall_n() -> usize {
    80
}
fn default_limit() -> usize {
    10
}
fn default_lambda() -> f32 {
    0.7
}
fn default_true() -> bool {
    true
}
fn default_mmr_pool_cap() -> usize {
    200
}
fn default_half_life() -> f32 {
    30.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Pin one backend by name; no fallback when set.
    #[serde(default)]
    pub backend: Option<String>,
    /// Resolution order when `backend` is unset.
    #[serde(default = "default_preference")]
    pub preference: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub max_seq_len: Option<usize>,
    /// Ollama base URL.
    #[serde(default)]
    pub url: Option<String>,
    /// Hugging Face repo holding `tokenizer.json` for the model.
    #[serde(default)]
    pub tokenizer_repo: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: None,
            preference: default_preference(),
            model: None,
            dims: None,
            max_seq_len: None,
            url: None,
            tokenizer_repo: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_preference() -> Vec<String> {
    vec!["local".to_string(), "ollama".to_string()]
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

pub const KNOWN_BACKENDS: &[&str] = &["local", "ollama"];

impl Config {
    /// Defaults around a database path, for tests and tooling.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            chunking: ChunkingConfig::default(),
            index: IndexConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }

    pub fn chunking_params(&self) -> ChunkingParams {
        ChunkingParams {
            target_tokens: self.chunking.target_tokens,
            max_tokens: self.chunking.max_tokens,
            overlap_tokens: self.chunking.overlap_tokens,
        }
    }

    pub fn indexer_config(&self) -> IndexerConfig {
        IndexerConfig {
            chunking: self.chunking_params(),
            batch_size: self.index.batch_size,
            max_chunks_per_build: self.index.max_chunks_per_build,
        }
    }

    pub fn search_params(&self) -> SearchParams {
        let r = &self.retrieval;
        SearchParams {
            recall_n: r.recall_n,
            limit: r.limit,
            lambda: r.lambda,
            diversity: r.diversity,
            mmr_pool_cap: r.mmr_pool_cap,
            threshold: r.threshold,
            recency_weight: r.recency_weight,
            recency_half_life_days: r.recency_half_life_days,
        }
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.chunking_params().validate()?;

        if self.index.batch_size == 0 {
            anyhow::bail!("index.batch_size must be > 0");
        }
        if self.index.max_chunks_per_build == 0 {
            anyhow::bail!("index.max_chunks_per_build must be > 0");
        }

        let r = &self.retrieval;
        if r.recall_n < 1 {
            anyhow::bail!("retrieval.recall_n must be >= 1");
        }
        if r.limit < 1 {
            anyhow::bail!("retrieval.limit must be >= 1");
        }
        if !(0.0..=1.0).contains(&r.lambda) {
            anyhow::bail!("retrieval.lambda must be in [0.0, 1.0]");
        }
        if r.mmr_pool_cap < 1 {
            anyhow::bail!("retrieval.mmr_pool_cap must be >= 1");
        }
        if r.recency_weight < 0.0 {
            anyhow::bail!("retrieval.recency_weight must be >= 0.0");
        }
        if r.recency_half_life_days <= 0.0 {
            anyhow::bail!("retrieval.recency_half_life_days must be > 0.0");
        }

        let e = &self.embedding;
        for name in e.backend.iter().chain(e.preference.iter()) {
            if !KNOWN_BACKENDS.contains(&name.as_str()) {
                anyhow::bail!(
                    "Unknown embedding backend: '{}'. Must be one of: {}.",
                    name,
                    KNOWN_BACKENDS.join(", ")
                );
            }
        }
        if e.backend.is_none() && e.preference.is_empty() {
            anyhow::bail!("embedding.preference must name at least one backend");
        }
        if e.dims == Some(0) {
            anyhow::bail!("embedding.dims must be > 0");
        }
        if e.max_seq_len == Some(0) {
            anyhow::bail!("embedding.max_seq_len must be > 0");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_defaults_from_db_only() {
        let config = parse("[db]\npath = \"x.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.target_tokens, 256);
        assert_eq!(config.chunking.max_tokens, 384);
        assert_eq!(config.index.batch_size, 32);
        assert_eq!(config.retrieval.recall_n, 80);
        assert!((config.retrieval.lambda - 0.7).abs() < 1e-6);
        assert_eq!(config.embedding.preference, vec!["local", "ollama"]);
    }

    #[test]
    fn test_rejects_lambda_out_of_range() {
        let err = parse("[db]\npath = \"x\"\n[retrieval]\nlambda = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("lambda"));
    }

    #[test]
    fn test_rejects_overlap_not_below_target() {
        let src = "[db]\npath = \"x\"\n[chunking]\ntarget_tokens = 32\nmax_tokens = 64\noverlap_tokens = 32\n";
        assert!(parse(src).is_err());
    }

    #[test]
    fn test_rejects_unknown_backend() {
        let err = parse("[db]\npath = \"x\"\n[embedding]\nbackend = \"openai\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown embedding backend"));
    }

    #[test]
    fn test_lock_path_sits_beside_db() {
        let config = Config::minimal("/tmp/data/t.sqlite");
        assert_eq!(
            config.db.lock_path(),
            PathBuf::from("/tmp/data/t.sqlite.lock")
        );
    }
}
