//! Embedding backend trait, backend resolution, and vector utilities.
//!
//! Defines the [`EmbeddingBackend`] trait that all embedding providers
//! implement, the fixed-order resolution policy used when the caller does
//! not name a backend, and pure helpers for vector serialization and
//! similarity.
//!
//! Concrete backends (fastembed, tract, Ollama) live in the `threadline`
//! app crate; the core only depends on this trait.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{BackendAttempt, EmbeddingError, FailureKind};
use crate::models::BackendFingerprint;
use crate::tokenize::TokenCounter;

/// A provider that turns text into fixed-dimension vectors.
///
/// Identical text under an identical (backend, model) pair must produce
/// bit-identical vectors. Any one-time model loading happens inside the
/// implementation and must be safe to trigger from concurrent calls.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Backend identifier stored in `IndexMeta` (e.g. `"local"`).
    fn name(&self) -> &str;
    /// Model identifier (e.g. `"all-minilm-l6-v2"`).
    fn model_name(&self) -> &str;
    /// Embedding vector dimensionality.
    fn dims(&self) -> usize;
    /// Longest input, in model tokens, the model embeds without truncation.
    fn max_seq_len(&self) -> usize;

    fn fingerprint(&self) -> BackendFingerprint {
        BackendFingerprint {
            backend: self.name().to_string(),
            model: self.model_name().to_string(),
            dims: self.dims(),
        }
    }

    /// Check that the backend can serve requests, without embedding anything.
    async fn probe(&self) -> std::result::Result<(), BackendAttempt>;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Tokenizer of the embedding model, for chunk sizing.
    async fn token_counter(&self) -> Result<Arc<dyn TokenCounter>>;
}

/// Pick a backend.
///
/// With `requested` set, only that backend is considered. Otherwise the
/// candidates are probed in the given order and the first healthy one wins.
/// On failure the error lists every backend tried and why.
pub async fn resolve_backend(
    requested: Option<&str>,
    candidates: Vec<Box<dyn EmbeddingBackend>>,
) -> std::result::Result<Box<dyn EmbeddingBackend>, EmbeddingError> {
    let mut attempts = Vec::new();

    if let Some(name) = requested {
        let known: Vec<String> = candidates.iter().map(|b| b.name().to_string()).collect();
        let Some(backend) = candidates.into_iter().find(|b| b.name() == name) else {
            attempts.push(BackendAttempt {
                backend: name.to_string(),
                kind: FailureKind::Misconfigured,
                detail: "unknown backend name".to_string(),
                remediation: format!("choose one of: {}", known.join(", ")),
            });
            return Err(EmbeddingError::BackendUnavailable { attempts });
        };
        return match backend.probe().await {
            Ok(()) => {
                info!(backend = name, model = backend.model_name(), "using requested embedding backend");
                Ok(backend)
            }
            Err(attempt) => {
                attempts.push(attempt);
                Err(EmbeddingError::BackendUnavailable { attempts })
            }
        };
    }

    for backend in candidates {
        match backend.probe().await {
            Ok(()) => {
                info!(
                    backend = backend.name(),
                    model = backend.model_name(),
                    "resolved embedding backend"
                );
                return Ok(backend);
            }
            Err(attempt) => {
                debug!(backend = backend.name(), reason = %attempt, "embedding backend unavailable");
                attempts.push(attempt);
            }
        }
    }

    Err(EmbeddingError::BackendUnavailable { attempts })
}

/// Embed a batch and verify the backend honoured its declared shape and
/// returned only finite values.
pub async fn embed_checked(
    backend: &dyn EmbeddingBackend,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let vectors = backend.embed(texts).await?;
    let bad_dims = vectors.iter().find(|v| v.len() != backend.dims());
    if vectors.len() != texts.len() || bad_dims.is_some() {
        return Err(EmbeddingError::ShapeMismatch {
            backend: backend.name().to_string(),
            got: vectors.len(),
            dims: bad_dims.map(|v| v.len()).unwrap_or(backend.dims()),
            expected: texts.len(),
            expected_dims: backend.dims(),
        }
        .into());
    }
    if let Some(index) = vectors.iter().position(|v| !v.iter().all(|x| x.is_finite())) {
        return Err(EmbeddingError::NonFiniteVector {
            backend: backend.name().to_string(),
            index,
        }
        .into());
    }
    Ok(vectors)
}

/// Embed a single query text.
pub async fn embed_query(backend: &dyn EmbeddingBackend, text: &str) -> Result<Vec<f32>> {
    let mut results = embed_checked(backend, &[text.to_string()]).await?;
    results
        .pop()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use threadline_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), Some(v));
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
///
/// Returns `None` when the byte length is not a multiple of 4 or any value
/// is not finite.
pub fn blob_to_vec(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    let vec: Vec<f32> = blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    if vec.iter().all(|v| v.is_finite()) {
        Some(vec)
    } else {
        None
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or vectors
/// of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HashingBackend;

    struct Unavailable {
        name: &'static str,
        kind: FailureKind,
    }

    #[async_trait]
    impl EmbeddingBackend for Unavailable {
        fn name(&self) -> &str {
            self.name
        }
        fn model_name(&self) -> &str {
            "none"
        }
        fn dims(&self) -> usize {
            0
        }
        fn max_seq_len(&self) -> usize {
            0
        }
        async fn probe(&self) -> std::result::Result<(), BackendAttempt> {
            Err(BackendAttempt {
                backend: self.name.to_string(),
                kind: self.kind,
                detail: "test".to_string(),
                remediation: "n/a".to_string(),
            })
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            anyhow::bail!("unavailable")
        }
        async fn token_counter(&self) -> Result<Arc<dyn TokenCounter>> {
            anyhow::bail!("unavailable")
        }
    }

    #[tokio::test]
    async fn test_resolve_takes_first_healthy_in_order() {
        let candidates: Vec<Box<dyn EmbeddingBackend>> = vec![
            Box::new(Unavailable {
                name: "local",
                kind: FailureKind::NotInstalled,
            }),
            Box::new(HashingBackend::new("hash", "bow", 64)),
            Box::new(HashingBackend::new("hash2", "bow", 32)),
        ];
        let backend = resolve_backend(None, candidates).await.unwrap();
        assert_eq!(backend.name(), "hash");
    }

    #[tokio::test]
    async fn test_resolve_reports_every_failure() {
        let candidates: Vec<Box<dyn EmbeddingBackend>> = vec![
            Box::new(Unavailable {
                name: "local",
                kind: FailureKind::NotInstalled,
            }),
            Box::new(Unavailable {
                name: "ollama",
                kind: FailureKind::NotReachable,
            }),
        ];
        let err = resolve_backend(None, candidates).await.err().unwrap();
        match err {
            EmbeddingError::BackendUnavailable { attempts } => {
                let names: Vec<&str> = attempts.iter().map(|a| a.backend.as_str()).collect();
                assert_eq!(names, vec!["local", "ollama"]);
                assert_eq!(attempts[0].kind, FailureKind::NotInstalled);
                assert_eq!(attempts[1].kind, FailureKind::NotReachable);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_requested_does_not_fall_back() {
        let candidates: Vec<Box<dyn EmbeddingBackend>> = vec![
            Box::new(HashingBackend::new("hash", "bow", 64)),
            Box::new(Unavailable {
                name: "ollama",
                kind: FailureKind::NotReachable,
            }),
        ];
        let err = resolve_backend(Some("ollama"), candidates).await.err().unwrap();
        assert!(err.to_string().contains("ollama: not reachable"));
    }

    #[tokio::test]
    async fn test_resolve_unknown_requested_name() {
        let candidates: Vec<Box<dyn EmbeddingBackend>> =
            vec![Box::new(HashingBackend::new("hash", "bow", 64))];
        let err = resolve_backend(Some("gpu"), candidates).await.err().unwrap();
        let msg = err.to_string();
        assert!(msg.contains("gpu: misconfigured"));
        assert!(msg.contains("choose one of: hash"));
    }

    /// Emits NaN for any text containing "nan".
    struct Poisoned;

    #[async_trait]
    impl EmbeddingBackend for Poisoned {
        fn name(&self) -> &str {
            "poisoned"
        }
        fn model_name(&self) -> &str {
            "nan"
        }
        fn dims(&self) -> usize {
            2
        }
        fn max_seq_len(&self) -> usize {
            16
        }
        async fn probe(&self) -> std::result::Result<(), BackendAttempt> {
            Ok(())
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| if t.contains("nan") { vec![f32::NAN, 1.0] } else { vec![1.0, 0.0] })
                .collect())
        }
        async fn token_counter(&self) -> Result<Arc<dyn TokenCounter>> {
            anyhow::bail!("unused")
        }
    }

    #[tokio::test]
    async fn test_embed_checked_rejects_non_finite() {
        let texts = vec!["fine".to_string(), "banana".to_string()];
        let err = embed_checked(&Poisoned, &texts).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EmbeddingError>(),
            Some(EmbeddingError::NonFiniteVector { index: 1, .. })
        ));
        assert!(embed_query(&Poisoned, "fine").await.is_ok());
    }

    #[tokio::test]
    async fn test_embed_query_shape() {
        let backend = HashingBackend::new("hash", "bow", 16);
        let v = embed_query(&backend, "token refresh").await.unwrap();
        assert_eq!(v.len(), 16);
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob_to_vec(&blob), Some(vec));
    }

    #[test]
    fn test_blob_rejects_torn_bytes() {
        assert_eq!(blob_to_vec(&[0u8, 1, 2]), None);
        assert_eq!(blob_to_vec(&f32::NAN.to_le_bytes()), None);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}
