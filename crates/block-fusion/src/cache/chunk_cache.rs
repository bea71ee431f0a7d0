//! LRU cache for decompressed source chunks.
//!
//! Prefetch loads native chunks of the selected views into this cache so
//! the fusion step finds them without touching storage.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::CacheStats;

/// Cache key for chunks: (view_path_hash, chunk index `[x, y, z]`).
pub type ChunkKey = (u64, [u64; 3]);

/// LRU cache for decompressed chunks with memory-bounded eviction.
///
/// Entries are reference counted, so a chunk evicted while a task still
/// holds it stays alive until that task drops its reference.
pub struct ChunkCache {
    cache: LruCache<ChunkKey, Arc<Vec<f32>>>,
    memory_limit: usize,
    current_memory: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ChunkCache {
    /// Create a new chunk cache with the given memory limit in bytes.
    pub fn new(memory_limit: usize) -> Self {
        // Estimate max entries assuming 64³ float chunks (1MB)
        let chunk_size_estimate = 64 * 64 * 64 * 4;
        let max_entries = (memory_limit / chunk_size_estimate).max(16);

        Self {
            cache: LruCache::new(NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN)),
            memory_limit,
            current_memory: 0,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Try to get a chunk from the cache.
    pub fn get(&mut self, key: &ChunkKey) -> Option<Arc<Vec<f32>>> {
        if let Some(data) = self.cache.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(Arc::clone(data))
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Insert a chunk into the cache.
    ///
    /// If the cache is at capacity, the least recently used entries
    /// will be evicted to make room.
    pub fn insert(&mut self, key: ChunkKey, data: Arc<Vec<f32>>) {
        let data_size = data.len() * std::mem::size_of::<f32>();

        while self.current_memory + data_size > self.memory_limit && !self.cache.is_empty() {
            if let Some((_, evicted)) = self.cache.pop_lru() {
                let evicted_size = evicted.len() * std::mem::size_of::<f32>();
                self.current_memory = self.current_memory.saturating_sub(evicted_size);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        if data_size <= self.memory_limit {
            if let Some((_, replaced)) = self.cache.push(key, data) {
                let replaced_size = replaced.len() * std::mem::size_of::<f32>();
                self.current_memory = self.current_memory.saturating_sub(replaced_size);
            }
            self.current_memory += data_size;
        }
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.len(),
            memory_bytes: self.current_memory as u64,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Get the current memory usage in bytes.
    pub fn memory_usage(&self) -> usize {
        self.current_memory
    }

    /// Get the number of entries in the cache.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Hash a source path for use in cache keys.
pub fn hash_path(path: &str) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(value: f32, len: usize) -> Arc<Vec<f32>> {
        Arc::new(vec![value; len])
    }

    #[test]
    fn test_cache_insert_and_get() {
        let mut cache = ChunkCache::new(1024 * 1024);

        let key = (123, [0, 0, 0]);
        let data = chunk(1.0, 4);

        assert!(cache.get(&key).is_none());
        cache.insert(key, data.clone());
        assert_eq!(cache.get(&key), Some(data));
    }

    #[test]
    fn test_cache_lru_eviction() {
        // 64 bytes = 16 f32s max
        let mut cache = ChunkCache::new(64);

        for i in 0..10 {
            cache.insert((0, [i, 0, 0]), chunk(i as f32, 4));
        }

        assert!(cache.get(&(0, [0, 0, 0])).is_none());
        assert!(cache.get(&(0, [9, 0, 0])).is_some());
        assert!(cache.stats().evictions > 0);
        assert!(cache.memory_usage() <= 64);
    }

    #[test]
    fn test_evicted_chunk_survives_while_referenced() {
        let mut cache = ChunkCache::new(16);
        cache.insert((0, [0, 0, 0]), chunk(7.0, 4));
        let held = cache.get(&(0, [0, 0, 0])).unwrap();

        cache.insert((0, [1, 0, 0]), chunk(8.0, 4));
        assert!(cache.get(&(0, [0, 0, 0])).is_none());
        assert_eq!(held[0], 7.0);
    }

    #[test]
    fn test_reinsert_does_not_double_count() {
        let mut cache = ChunkCache::new(1024);
        cache.insert((0, [0, 0, 0]), chunk(1.0, 4));
        cache.insert((0, [0, 0, 0]), chunk(2.0, 4));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.memory_usage(), 16);
    }

    #[test]
    fn test_cache_stats() {
        let mut cache = ChunkCache::new(1024 * 1024);

        cache.insert((0, [0, 0, 0]), chunk(1.0, 4));
        cache.get(&(0, [0, 0, 0]));
        cache.get(&(0, [1, 0, 0]));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_hash_path() {
        let hash1 = hash_path("/data/tile0.zarr");
        let hash2 = hash_path("/data/tile0.zarr");
        let hash3 = hash_path("/data/tile1.zarr");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
    }
}
