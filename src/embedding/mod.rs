//! Embedding capability and supporting machinery.
//!
//! The model forward pass is an external capability behind the [`Embedder`]
//! trait. The engine adds a content-hash LRU cache and a bounded worker pool
//! with caller-supplied cancellation on top of it.

pub mod cache;
pub mod worker;

use async_trait::async_trait;

use crate::errors::EngineError;

pub use cache::EmbeddingCache;
pub use worker::EmbeddingPool;

/// Opaque embedding capability provided by the host.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one text into a fixed-length vector.
    ///
    /// Returns `EngineError::EmbeddingUnavailable` while the backing model is
    /// not ready.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError>;

    /// The fixed output dimension of this embedder.
    fn dimension(&self) -> usize;
}

/// Reject a vector whose length differs from the configured dimension.
pub fn check_dimension(expected: usize, vector: &[f32]) -> Result<(), EngineError> {
    if vector.len() != expected {
        return Err(EngineError::EmbeddingDimensionMismatch {
            expected,
            got: vector.len(),
        });
    }
    Ok(())
}

/// L2-normalize a vector in place; zero vectors are left untouched.
pub fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
    vector
}

/// Cosine similarity. Inputs stored by the engine are unit length, so this is
/// a dot product with a guard for degenerate vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm_a * norm_b;

    if denom <= f32::EPSILON {
        0.0
    } else {
        (dot / denom).clamp(-1.0, 1.0)
    }
}
