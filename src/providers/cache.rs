use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Thread-safe LRU cache for query embeddings
///
/// Repeated queries skip the embedding API; memory stays bounded by `capacity`.
pub struct EmbeddingCache {
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl EmbeddingCache {
    /// Capacity 0 is treated as 1
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn get(&self, query: &str) -> Option<Vec<f32>> {
        self.cache.lock().ok()?.get(query).cloned()
    }

    pub fn put(&self, query: String, embedding: Vec<f32>) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(query, embedding);
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
