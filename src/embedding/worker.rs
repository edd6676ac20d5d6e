//! Bounded embedding worker pool.
//!
//! Embedding is the expensive step, so requests go through a semaphore sized
//! to `min(max(1, cores / 2), 4)` permits. Workers hold no engine state; the
//! caller applies results after a worker returns. Every request carries a
//! caller-supplied [`CancellationToken`] so a superseded query stops
//! consuming capacity.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::{check_dimension, normalize, Embedder, EmbeddingCache};
use crate::errors::EngineError;

pub struct EmbeddingPool {
    embedder: Arc<dyn Embedder>,
    cache: EmbeddingCache,
    permits: Arc<Semaphore>,
    dim: usize,
}

impl EmbeddingPool {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        workers: usize,
        cache_entries: usize,
        dim: usize,
    ) -> Self {
        Self {
            embedder,
            cache: EmbeddingCache::new(cache_entries),
            permits: Arc::new(Semaphore::new(workers.max(1))),
            dim,
        }
    }

    /// Embed one text, consulting the cache first.
    ///
    /// The returned vector is dimension-checked and L2-normalized.
    pub async fn embed(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, EngineError> {
        if let Some(hit) = self.cache.get(text) {
            return Ok(hit);
        }

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| EngineError::Cancelled)?
            }
        };

        let vector = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = self.embedder.embed(text) => result?,
        };

        check_dimension(self.dim, &vector)?;
        let vector = normalize(vector);
        self.cache.put(text, vector.clone());
        Ok(vector)
    }

    /// Embed a batch of texts for document ingestion.
    ///
    /// A dimension mismatch fails only the affected text: it is logged and
    /// reported as `None` so the caller can skip that record.
    pub async fn embed_batch(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Option<Vec<f32>>>, EngineError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            match self.embed(text, cancel).await {
                Ok(vector) => out.push(Some(vector)),
                Err(EngineError::EmbeddingDimensionMismatch { expected, got }) => {
                    tracing::warn!(expected, got, "skipping chunk with mismatched embedding");
                    out.push(None);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }
}
