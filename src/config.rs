//! Engine configuration.
//!
//! The host constructs an [`EngineConfig`] (directly or from a TOML file) and
//! passes it to `EngineHandle::open`. There is no implicit global state: the
//! engine lifecycle is fully owned by the caller.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Dimension of the reference embedding model (all-MiniLM family).
pub const DEFAULT_EMBEDDING_DIM: usize = 384;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database file backing documents, vectors, and facts.
    pub db_path: PathBuf,
    /// Fixed embedding dimension; any mismatch is an error, never a truncation.
    pub embedding_dim: usize,
    /// Maximum documents per owner.
    pub pool_capacity: usize,
    /// Maximum chunk size in characters.
    pub chunk_size: usize,
    /// Overlap between consecutive chunks in characters.
    pub chunk_overlap: usize,
    /// Upper bound on chunks per document.
    pub max_chunks_per_document: usize,
    /// Number of chunks retrieved per query before budgeting.
    pub top_k: usize,
    /// Minimum cosine similarity for a retrieved chunk.
    pub min_score: f32,
    /// Number of fixed sample vectors used by the coarse prefilter.
    pub sample_vector_count: usize,
    /// Entries in the LRU embedding cache.
    pub embedding_cache_entries: usize,
    /// Override for the embedding worker count; `None` derives it from cores.
    pub embed_workers: Option<usize>,
    /// Run invariant assertions on production paths.
    pub guard_enabled: bool,
    /// Fall back to keyword-only retrieval when the embedder is unavailable.
    pub keyword_fallback: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("session_rag.db"),
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            pool_capacity: 100,
            chunk_size: 500,
            chunk_overlap: 50,
            max_chunks_per_document: 256,
            top_k: 8,
            min_score: 0.3,
            sample_vector_count: 8,
            embedding_cache_entries: 500,
            embed_workers: None,
            guard_enabled: true,
            keyword_fallback: true,
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a TOML file. Missing keys take defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("read {}: {e}", path.display())))?;
        toml::from_str(&raw).map_err(|e| EngineError::Config(format!("parse {}: {e}", path.display())))
    }

    /// Worker pool size: `min(max(1, cores / 2), 4)` unless overridden.
    pub fn embed_worker_count(&self) -> usize {
        if let Some(n) = self.embed_workers {
            return n.max(1);
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (cores / 2).max(1).min(4)
    }
}
