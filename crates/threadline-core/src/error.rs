//! Error types for threadline-core.
//!
//! Fatal conditions are typed so callers can match on them (or
//! `downcast_ref` them out of an `anyhow::Error`); every message carries the
//! remediation a user needs. Non-fatal conditions (oversized fragments,
//! malformed stored chunks) are counted in reports instead.

use std::fmt;

use thiserror::Error;

use crate::models::BackendFingerprint;

/// Why a single embedding backend could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Support was not compiled in or the runtime is missing.
    NotInstalled,
    /// The backend exists but could not be contacted.
    NotReachable,
    /// The backend is present but its configuration is invalid.
    Misconfigured,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::NotInstalled => "not installed",
            FailureKind::NotReachable => "not reachable",
            FailureKind::Misconfigured => "misconfigured",
        };
        f.write_str(s)
    }
}

/// One entry in the list of backends tried during resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAttempt {
    pub backend: String,
    pub kind: FailureKind,
    pub detail: String,
    pub remediation: String,
}

impl fmt::Display for BackendAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({}); {}",
            self.backend, self.kind, self.detail, self.remediation
        )
    }
}

fn format_attempts(attempts: &[BackendAttempt]) -> String {
    if attempts.is_empty() {
        return "no backends configured; set [embedding] preference".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("\n  - {}", a))
        .collect::<String>()
}

/// Errors from embedding backends.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// No configured embedding backend could be initialized.
    #[error("No embedding backend available. Tried:{}", format_attempts(.attempts))]
    BackendUnavailable { attempts: Vec<BackendAttempt> },

    /// The backend returned vectors that do not match its declared shape.
    #[error("Backend '{backend}' returned {got} vectors of dimension {dims}, expected {expected} of dimension {expected_dims}")]
    ShapeMismatch {
        backend: String,
        got: usize,
        dims: usize,
        expected: usize,
        expected_dims: usize,
    },

    /// The backend returned a vector containing NaN or infinity.
    #[error("Backend '{backend}' returned a non-finite value in vector {index}; check the model files or server")]
    NonFiniteVector { backend: String, index: usize },
}

/// Errors from the vector index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Incremental add attempted against an index built with another
    /// backend, model, or dimension. Existing rows are untouched.
    #[error("Index was built with {stored}, but the current backend is {current}. Run `threadline index build --rebuild` to re-embed everything with the current backend.")]
    IncompatibleIndex {
        stored: BackendFingerprint,
        current: BackendFingerprint,
    },

    /// Stored schema version differs from what this build understands.
    #[error("Index schema version {found} does not match expected version {expected}. Run `threadline index build --rebuild` against a fresh database path.")]
    SchemaMismatch { found: u32, expected: u32 },

    /// A write was attempted through a store opened for reading.
    #[error("Refusing to {operation}: the index store was opened read-only")]
    ReadOnlyViolation { operation: String },

    /// Another process holds the single-writer build lock.
    #[error("Another index build holds the lock at {path}. Wait for it to finish and retry.")]
    BuildInProgress { path: String },

    /// Searching before any index has been built.
    #[error("No vector index has been built yet. Run `threadline index build` first.")]
    NotBuilt,
}

/// Errors raised before a search reaches any backend.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Query contains no embeddable text")]
    EmptyQuery,

    #[error("lambda must be in [0.0, 1.0], got {0}")]
    InvalidLambda(f32),
}
