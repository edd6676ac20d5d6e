use thiserror::Error;

use crate::guard::InvariantViolation;

/// Error taxonomy for the retrieval engine.
///
/// `CapacityExceeded` is recoverable and user-facing. `EmbeddingDimensionMismatch`
/// is fatal for the affected record only. `EmbeddingUnavailable` is retryable.
/// `Invariant` wraps a programming error and must never be suppressed.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("document pool full: {count}/{capacity}; delete a document to continue")]
    CapacityExceeded { count: usize, capacity: usize },

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    EmbeddingDimensionMismatch { expected: usize, got: usize },

    #[error("embedding backend unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("{vector_count} orphaned vectors reference {document_count} missing documents")]
    OrphanedVectorsDetected {
        document_count: usize,
        vector_count: usize,
    },

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("document {doc_id} is not owned by {owner_id}")]
    NotOwner { doc_id: String, owner_id: String },

    #[error("retrieval mode {mode} is not available on tier {tier}")]
    ModeNotAllowed { tier: String, mode: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl EngineError {
    /// True for errors the caller is expected to retry after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::EmbeddingUnavailable(_))
    }
}
