//! Token counting.
//!
//! The engine budgets context in tokens. Without a real tokenizer it falls
//! back to a fixed characters-per-token ratio; hosts that ship a HuggingFace
//! tokenizer file can supply [`HfTokenEstimator`] instead.

use std::path::Path;

use crate::errors::EngineError;

/// Estimates the token count of a piece of text.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// Default estimator: ~4 characters per token for English text.
#[derive(Debug, Clone)]
pub struct CharRatioEstimator {
    chars_per_token: usize,
}

impl CharRatioEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        (text.len() + self.chars_per_token - 1) / self.chars_per_token
    }
}

/// Estimator backed by a HuggingFace `tokenizer.json` file.
pub struct HfTokenEstimator {
    inner: tokenizers::Tokenizer,
}

impl HfTokenEstimator {
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| EngineError::Tokenizer(e.to_string()))?;
        Ok(Self { inner })
    }
}

impl TokenEstimator for HfTokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        match self.inner.encode(text, false) {
            Ok(encoding) => encoding.get_ids().len(),
            // Tokenization failures degrade to the ratio estimate.
            Err(_) => CharRatioEstimator::default().estimate(text),
        }
    }
}
