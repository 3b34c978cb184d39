//! Concrete embedding backends.
//!
//! - **[`LocalBackend`]** runs models in-process via fastembed (primary) or
//!   tract (musl/Intel Mac). Models download from Hugging Face on first use;
//!   after that embedding is fully offline.
//! - **[`OllamaBackend`]** calls a local Ollama instance's `/api/embed`.
//!
//! Both implement [`EmbeddingBackend`] from `threadline-core`, so the
//! indexer and retriever never see which one is in use. [`resolve`] builds
//! the candidate list from configuration and hands it to
//! [`resolve_backend`] for probing.
//!
//! # Retry Strategy
//!
//! The Ollama backend uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

#[cfg(feature = "local-embeddings-tract")]
mod local_tract;
pub mod tokenizer;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use threadline_core::embedding::{resolve_backend, EmbeddingBackend};
use threadline_core::error::{BackendAttempt, FailureKind};
use threadline_core::tokenize::TokenCounter;

use crate::config::{Config, EmbeddingConfig, KNOWN_BACKENDS};
use tokenizer::HfTokenCounter;

pub const DEFAULT_LOCAL_MODEL: &str = "all-minilm-l6-v2";
pub const DEFAULT_OLLAMA_MODEL: &str = "nomic-embed-text";
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Known shape of an embedding model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: &'static str,
    pub dims: usize,
    pub max_seq_len: usize,
    /// Hugging Face repo carrying the model's `tokenizer.json`.
    pub tokenizer_repo: &'static str,
}

const fn spec(
    name: &'static str,
    dims: usize,
    max_seq_len: usize,
    tokenizer_repo: &'static str,
) -> ModelSpec {
    ModelSpec {
        name,
        dims,
        max_seq_len,
        tokenizer_repo,
    }
}

pub const LOCAL_MODELS: &[ModelSpec] = &[
    spec("all-minilm-l6-v2", 384, 256, "sentence-transformers/all-MiniLM-L6-v2"),
    spec("bge-small-en-v1.5", 384, 512, "BAAI/bge-small-en-v1.5"),
    spec("bge-base-en-v1.5", 768, 512, "BAAI/bge-base-en-v1.5"),
    spec("bge-large-en-v1.5", 1024, 512, "BAAI/bge-large-en-v1.5"),
    spec("nomic-embed-text-v1", 768, 512, "nomic-ai/nomic-embed-text-v1"),
    spec("nomic-embed-text-v1.5", 768, 512, "nomic-ai/nomic-embed-text-v1.5"),
    spec("multilingual-e5-small", 384, 512, "intfloat/multilingual-e5-small"),
    spec("multilingual-e5-base", 768, 512, "intfloat/multilingual-e5-base"),
    spec("multilingual-e5-large", 1024, 512, "intfloat/multilingual-e5-large"),
];

pub const OLLAMA_MODELS: &[ModelSpec] = &[
    spec("nomic-embed-text", 768, 2048, "nomic-ai/nomic-embed-text-v1.5"),
    spec("mxbai-embed-large", 1024, 512, "mixedbread-ai/mxbai-embed-large-v1"),
    spec("all-minilm", 384, 256, "sentence-transformers/all-MiniLM-L6-v2"),
    spec("bge-m3", 1024, 8192, "BAAI/bge-m3"),
];

/// Find `name` in a manifest. An Ollama `:tag` suffix is ignored.
pub fn lookup_model(table: &'static [ModelSpec], name: &str) -> Option<&'static ModelSpec> {
    let base = name.split(':').next().unwrap_or(name);
    table.iter().find(|m| m.name == base)
}

/// Model settings after merging configuration over the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ModelChoice {
    name: String,
    dims: usize,
    max_seq_len: usize,
    tokenizer_repo: String,
    /// Why this choice cannot be used; reported by `probe`.
    problem: Option<String>,
}

fn choose_model(
    table: &'static [ModelSpec],
    default_model: &str,
    config: &EmbeddingConfig,
    allow_custom: bool,
) -> ModelChoice {
    let name = config
        .model
        .clone()
        .unwrap_or_else(|| default_model.to_string());

    if let Some(spec) = lookup_model(table, &name) {
        let problem = match config.dims {
            Some(d) if d != spec.dims => Some(format!(
                "embedding.dims = {} but model '{}' produces {} dimensions",
                d, name, spec.dims
            )),
            _ => None,
        };
        return ModelChoice {
            dims: spec.dims,
            max_seq_len: config.max_seq_len.unwrap_or(spec.max_seq_len),
            tokenizer_repo: config
                .tokenizer_repo
                .clone()
                .unwrap_or_else(|| spec.tokenizer_repo.to_string()),
            name,
            problem,
        };
    }

    let problem = if !allow_custom {
        let known: Vec<&str> = table.iter().map(|m| m.name).collect();
        Some(format!(
            "unknown model '{}'; supported models: {}",
            name,
            known.join(", ")
        ))
    } else if config.dims.is_none() || config.tokenizer_repo.is_none() {
        Some(format!(
            "model '{}' is not in the built-in list; set embedding.dims and embedding.tokenizer_repo",
            name
        ))
    } else {
        None
    };
    ModelChoice {
        name,
        dims: config.dims.unwrap_or(0),
        max_seq_len: config.max_seq_len.unwrap_or(512),
        tokenizer_repo: config.tokenizer_repo.clone().unwrap_or_default(),
        problem,
    }
}

fn misconfigured(backend: &str, detail: String) -> BackendAttempt {
    BackendAttempt {
        backend: backend.to_string(),
        kind: FailureKind::Misconfigured,
        detail,
        remediation: "fix the [embedding] section of the config file".to_string(),
    }
}

/// Load the model's Hugging Face tokenizer off the async runtime.
async fn load_token_counter(repo: &str) -> Result<Arc<dyn TokenCounter>> {
    let repo = repo.to_string();
    let counter = tokio::task::spawn_blocking(move || HfTokenCounter::load(&repo)).await??;
    Ok(Arc::new(counter))
}

// ============ Local Backend (fastembed or tract) ============

enum LocalEngine {
    #[cfg(feature = "local-embeddings-fastembed")]
    FastEmbed(std::sync::Mutex<fastembed::TextEmbedding>),
    #[cfg(all(
        feature = "local-embeddings-tract",
        not(feature = "local-embeddings-fastembed")
    ))]
    Tract(local_tract::TractModel),
}

impl LocalEngine {
    /// Download (first use) and load the model. Blocking.
    #[cfg(feature = "local-embeddings-fastembed")]
    fn load(model_name: &str) -> Result<Self> {
        let model = config_to_fastembed_model(model_name)?;
        let engine = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(model).with_show_download_progress(true),
        )
        .map_err(|e| anyhow!("Failed to initialize local embedding model: {}", e))?;
        Ok(LocalEngine::FastEmbed(std::sync::Mutex::new(engine)))
    }

    #[cfg(all(
        feature = "local-embeddings-tract",
        not(feature = "local-embeddings-fastembed")
    ))]
    fn load(model_name: &str) -> Result<Self> {
        Ok(LocalEngine::Tract(local_tract::TractModel::load(model_name)?))
    }

    #[cfg(not(any(
        feature = "local-embeddings-fastembed",
        feature = "local-embeddings-tract"
    )))]
    fn load(_model_name: &str) -> Result<Self> {
        bail!("local embedding support is not compiled in")
    }

    /// Blocking.
    fn embed(&self, texts: &[String], batch_size: usize) -> Result<Vec<Vec<f32>>> {
        match self {
            #[cfg(feature = "local-embeddings-fastembed")]
            LocalEngine::FastEmbed(model) => {
                let mut model = model
                    .lock()
                    .map_err(|_| anyhow!("local embedding model lock poisoned"))?;
                model
                    .embed(texts.to_vec(), Some(batch_size))
                    .map_err(|e| anyhow!("Local embedding failed: {}", e))
            }
            #[cfg(all(
                feature = "local-embeddings-tract",
                not(feature = "local-embeddings-fastembed")
            ))]
            LocalEngine::Tract(model) => model.embed(texts, batch_size),
            #[cfg(not(any(
                feature = "local-embeddings-fastembed",
                feature = "local-embeddings-tract"
            )))]
            _ => {
                let _ = (texts, batch_size);
                bail!("local embedding support is not compiled in")
            }
        }
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => bail!("Unknown local embedding model: '{}'", other),
    }
}

/// Whether the compiled-in engine can run `model_name`.
fn local_engine_supports(model_name: &str) -> bool {
    #[cfg(feature = "local-embeddings-fastembed")]
    {
        config_to_fastembed_model(model_name).is_ok()
    }
    #[cfg(all(
        feature = "local-embeddings-tract",
        not(feature = "local-embeddings-fastembed")
    ))]
    {
        local_tract::supports(model_name)
    }
    #[cfg(not(any(
        feature = "local-embeddings-fastembed",
        feature = "local-embeddings-tract"
    )))]
    {
        let _ = model_name;
        false
    }
}

const LOCAL_COMPILED: bool = cfg!(any(
    feature = "local-embeddings-fastembed",
    feature = "local-embeddings-tract"
));

/// In-process embedding backend (`"local"`).
///
/// The model loads once, lazily, on the first `probe` or `embed`; later
/// calls share it. Inference runs on the blocking thread pool.
pub struct LocalBackend {
    model: ModelChoice,
    batch_size: usize,
    engine: OnceCell<Arc<LocalEngine>>,
    counter: OnceCell<Arc<dyn TokenCounter>>,
}

impl LocalBackend {
    pub fn new(config: &EmbeddingConfig, batch_size: usize) -> Self {
        Self {
            model: choose_model(LOCAL_MODELS, DEFAULT_LOCAL_MODEL, config, false),
            batch_size: batch_size.max(1),
            engine: OnceCell::new(),
            counter: OnceCell::new(),
        }
    }

    async fn engine(&self) -> Result<Arc<LocalEngine>> {
        let engine = self
            .engine
            .get_or_try_init(|| async {
                let name = self.model.name.clone();
                info!(model = %name, "loading local embedding model");
                let engine = tokio::task::spawn_blocking(move || LocalEngine::load(&name)).await??;
                Ok::<_, anyhow::Error>(Arc::new(engine))
            })
            .await?;
        Ok(Arc::clone(engine))
    }
}

#[async_trait]
impl EmbeddingBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn model_name(&self) -> &str {
        &self.model.name
    }

    fn dims(&self) -> usize {
        self.model.dims
    }

    fn max_seq_len(&self) -> usize {
        self.model.max_seq_len
    }

    async fn probe(&self) -> std::result::Result<(), BackendAttempt> {
        if !LOCAL_COMPILED {
            return Err(BackendAttempt {
                backend: "local".to_string(),
                kind: FailureKind::NotInstalled,
                detail: "local embedding support is not compiled in".to_string(),
                remediation: "rebuild with --features local-embeddings-fastembed (or local-embeddings-tract)"
                    .to_string(),
            });
        }
        if let Some(problem) = &self.model.problem {
            return Err(misconfigured("local", problem.clone()));
        }
        if !local_engine_supports(&self.model.name) {
            return Err(misconfigured(
                "local",
                format!(
                    "model '{}' is not supported by the compiled-in engine",
                    self.model.name
                ),
            ));
        }
        self.engine().await.map(|_| ()).map_err(|e| BackendAttempt {
            backend: "local".to_string(),
            kind: FailureKind::NotInstalled,
            detail: format!("{:#}", e),
            remediation: "allow the one-time model download from huggingface.co, or point THREADLINE_CACHE_DIR at a populated model cache"
                .to_string(),
        })
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if let Some(problem) = &self.model.problem {
            bail!("local backend misconfigured: {}", problem);
        }
        let engine = self.engine().await?;
        let texts = texts.to_vec();
        let batch_size = self.batch_size;
        tokio::task::spawn_blocking(move || engine.embed(&texts, batch_size)).await?
    }

    async fn token_counter(&self) -> Result<Arc<dyn TokenCounter>> {
        let counter = self
            .counter
            .get_or_try_init(|| load_token_counter(&self.model.tokenizer_repo))
            .await?;
        Ok(Arc::clone(counter))
    }
}

// ============ Ollama Backend ============

/// Embedding backend using a local Ollama instance (`"ollama"`).
///
/// Calls `POST /api/embed` on the configured URL (default
/// `http://localhost:11434`). Requires the model to be pulled
/// (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaBackend {
    model: ModelChoice,
    url: String,
    timeout_secs: u64,
    max_retries: u32,
    counter: OnceCell<Arc<dyn TokenCounter>>,
}

impl OllamaBackend {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            model: choose_model(OLLAMA_MODELS, DEFAULT_OLLAMA_MODEL, config, true),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            timeout_secs: config.timeout_secs,
            max_retries: config.max_retries,
            counter: OnceCell::new(),
        }
    }

    fn client(&self, timeout_secs: u64) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?)
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model_name(&self) -> &str {
        &self.model.name
    }

    fn dims(&self) -> usize {
        self.model.dims
    }

    fn max_seq_len(&self) -> usize {
        self.model.max_seq_len
    }

    async fn probe(&self) -> std::result::Result<(), BackendAttempt> {
        if let Some(problem) = &self.model.problem {
            return Err(misconfigured("ollama", problem.clone()));
        }
        let not_reachable = |detail: String| BackendAttempt {
            backend: "ollama".to_string(),
            kind: FailureKind::NotReachable,
            detail,
            remediation: format!("start Ollama (`ollama serve`) at {}", self.url),
        };

        let client = self
            .client(self.timeout_secs.min(5))
            .map_err(|e| not_reachable(e.to_string()))?;
        let response = client
            .get(format!("{}/api/tags", self.url))
            .send()
            .await
            .map_err(|e| not_reachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(not_reachable(format!("GET /api/tags returned {}", response.status())));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| not_reachable(format!("invalid /api/tags response: {}", e)))?;

        if !has_model(&json, &self.model.name) {
            return Err(BackendAttempt {
                backend: "ollama".to_string(),
                kind: FailureKind::Misconfigured,
                detail: format!("model '{}' is not available in Ollama", self.model.name),
                remediation: format!("run `ollama pull {}`", self.model.name),
            });
        }
        debug!(url = %self.url, model = %self.model.name, "ollama is reachable");
        Ok(())
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if let Some(problem) = &self.model.problem {
            bail!("ollama backend misconfigured: {}", problem);
        }
        let client = self.client(self.timeout_secs)?;
        let body = serde_json::json!({
            "model": self.model.name,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(attempt, delay_secs = delay.as_secs(), "retrying ollama embed");
                tokio::time::sleep(delay).await;
            }

            let resp = client
                .post(format!("{}/api/embed", self.url))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_ollama_response(&json);
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow!("Ollama API error {}: {}", status, body_text));
                        continue;
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Ollama API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow!(
                        "Ollama connection error (is Ollama running at {}?): {}",
                        self.url,
                        e
                    ));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("Ollama embedding failed after retries")))
    }

    async fn token_counter(&self) -> Result<Arc<dyn TokenCounter>> {
        let counter = self
            .counter
            .get_or_try_init(|| load_token_counter(&self.model.tokenizer_repo))
            .await?;
        Ok(Arc::clone(counter))
    }
}

/// Whether an `/api/tags` listing contains `model` (`name` and `name:latest` match).
fn has_model(tags: &serde_json::Value, model: &str) -> bool {
    let wanted_base = model.split(':').next().unwrap_or(model);
    let wanted_tag = model.split_once(':').map(|(_, t)| t).unwrap_or("latest");
    tags.get("models")
        .and_then(|m| m.as_array())
        .map(|models| {
            models.iter().any(|m| {
                let Some(name) = m.get("name").and_then(|n| n.as_str()) else {
                    return false;
                };
                let (base, tag) = name.split_once(':').unwrap_or((name, "latest"));
                base == wanted_base && tag == wanted_tag
            })
        })
        .unwrap_or(false)
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| anyhow!("Invalid Ollama response: embedding is not an array"))?
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|x| x as f32)
                    .ok_or_else(|| anyhow!("Invalid Ollama response: non-numeric value {} in embedding", v))
            })
            .collect::<Result<_>>()?;
        result.push(vec);
    }

    Ok(result)
}

// ============ Resolution ============

fn backend_by_name(name: &str, config: &Config) -> Option<Box<dyn EmbeddingBackend>> {
    match name {
        "local" => Some(Box::new(LocalBackend::new(
            &config.embedding,
            config.index.batch_size,
        ))),
        "ollama" => Some(Box::new(OllamaBackend::new(&config.embedding))),
        _ => None,
    }
}

/// Candidate backends in probing order.
///
/// Without a requested name, the configured preference order is used.
/// With one, every known backend is offered so resolution can report an
/// unknown name against the full list.
pub fn candidates_from_config(
    config: &Config,
    requested: Option<&str>,
) -> Vec<Box<dyn EmbeddingBackend>> {
    let names: Vec<&str> = match requested {
        Some(_) => KNOWN_BACKENDS.to_vec(),
        None => config.embedding.preference.iter().map(String::as_str).collect(),
    };
    names
        .into_iter()
        .filter_map(|name| backend_by_name(name, config))
        .collect()
}

/// Resolve the embedding backend for this run.
///
/// `requested` (a CLI flag) wins over `embedding.backend`; when both are
/// unset the preference order applies.
pub async fn resolve(config: &Config, requested: Option<&str>) -> Result<Box<dyn EmbeddingBackend>> {
    let requested = requested.or(config.embedding.backend.as_deref());
    let candidates = candidates_from_config(config, requested);
    Ok(resolve_backend(requested, candidates).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding_config(toml_src: &str) -> EmbeddingConfig {
        toml::from_str(toml_src).unwrap()
    }

    #[test]
    fn test_lookup_ignores_ollama_tag() {
        let m = lookup_model(OLLAMA_MODELS, "nomic-embed-text:latest").unwrap();
        assert_eq!(m.dims, 768);
        assert!(lookup_model(LOCAL_MODELS, "no-such-model").is_none());
    }

    #[test]
    fn test_default_models() {
        let cfg = EmbeddingConfig::default();
        let local = LocalBackend::new(&cfg, 32);
        assert_eq!(local.model_name(), "all-minilm-l6-v2");
        assert_eq!(local.dims(), 384);
        assert_eq!(local.max_seq_len(), 256);

        let ollama = OllamaBackend::new(&cfg);
        assert_eq!(ollama.model_name(), "nomic-embed-text");
        assert_eq!(ollama.dims(), 768);
        assert_eq!(ollama.url, DEFAULT_OLLAMA_URL);
    }

    #[test]
    fn test_unknown_ollama_model_needs_dims_and_tokenizer() {
        let cfg = embedding_config(r#"model = "my-embedder""#);
        let choice = choose_model(OLLAMA_MODELS, DEFAULT_OLLAMA_MODEL, &cfg, true);
        assert!(choice.problem.is_some());

        let cfg = embedding_config(
            r#"
            model = "my-embedder"
            dims = 512
            tokenizer_repo = "acme/my-embedder"
            "#,
        );
        let choice = choose_model(OLLAMA_MODELS, DEFAULT_OLLAMA_MODEL, &cfg, true);
        assert_eq!(choice.problem, None);
        assert_eq!(choice.dims, 512);
        assert_eq!(choice.max_seq_len, 512);
    }

    #[test]
    fn test_dims_disagreeing_with_model_is_a_problem() {
        let cfg = embedding_config(
            r#"
            model = "bge-base-en-v1.5"
            dims = 384
            "#,
        );
        let choice = choose_model(LOCAL_MODELS, DEFAULT_LOCAL_MODEL, &cfg, false);
        assert!(choice.problem.unwrap().contains("768"));
    }

    #[tokio::test]
    async fn test_misconfigured_backend_fails_probe() {
        let cfg = embedding_config(r#"model = "my-embedder""#);
        let err = OllamaBackend::new(&cfg).probe().await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Misconfigured);
        assert_eq!(err.backend, "ollama");
    }

    #[test]
    fn test_parse_ollama_response() {
        let json = serde_json::json!({"embeddings": [[0.5, -1.0], [0.0, 2.0]]});
        let vectors = parse_ollama_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![0.5, -1.0], vec![0.0, 2.0]]);

        assert!(parse_ollama_response(&serde_json::json!({"embedding": []})).is_err());

        let err = parse_ollama_response(&serde_json::json!({"embeddings": [[0.5, null]]})).unwrap_err();
        assert!(err.to_string().contains("non-numeric"));
    }

    #[test]
    fn test_has_model_matches_latest_tag() {
        let tags = serde_json::json!({"models": [
            {"name": "nomic-embed-text:latest"},
            {"name": "bge-m3:567m"}
        ]});
        assert!(has_model(&tags, "nomic-embed-text"));
        assert!(has_model(&tags, "nomic-embed-text:latest"));
        assert!(has_model(&tags, "bge-m3:567m"));
        assert!(!has_model(&tags, "bge-m3"));
        assert!(!has_model(&tags, "all-minilm"));
    }

    #[test]
    fn test_candidates_follow_preference() {
        let mut config = Config::minimal("/tmp/unused.sqlite");
        config.embedding.preference = vec!["ollama".to_string()];
        let names: Vec<String> = candidates_from_config(&config, None)
            .iter()
            .map(|b| b.name().to_string())
            .collect();
        assert_eq!(names, vec!["ollama"]);

        let names: Vec<String> = candidates_from_config(&config, Some("local"))
            .iter()
            .map(|b| b.name().to_string())
            .collect();
        assert_eq!(names, vec!["local", "ollama"]);
    }

    #[tokio::test]
    async fn test_resolve_reports_unknown_requested_backend() {
        let config = Config::minimal("/tmp/unused.sqlite");
        let err = resolve(&config, Some("openai")).await.err().unwrap();
        let msg = err.to_string();
        assert!(msg.contains("openai"));
        assert!(msg.contains("local, ollama"));
    }
}
