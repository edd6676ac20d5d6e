//! Bounded LRU cache in front of the embedder.
//!
//! Keyed by a sha256 content hash so identical text never pays for a second
//! forward pass. Evictable, never a source of truth.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use sha2::{Digest, Sha256};

pub struct EmbeddingCache {
    inner: Mutex<LruCache<String, Vec<f32>>>,
}

impl EmbeddingCache {
    pub fn new(entries: usize) -> Self {
        let capacity = NonZeroUsize::new(entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        let key = content_key(text);
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let hit = cache.get(&key).cloned();
        if hit.is_some() {
            tracing::debug!(key = %key, "embedding cache hit");
        }
        hit
    }

    pub fn put(&self, text: &str, vector: Vec<f32>) {
        let key = content_key(text);
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(key, vector);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn content_key(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}
