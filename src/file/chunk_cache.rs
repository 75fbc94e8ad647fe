//! Recently released chunks of one file

use lru::LruCache;
use std::num::NonZeroUsize;

use super::chunk::CacheFileChunk;

/// LRU of clean chunks nobody references any more
///
/// A chunk released by its last consumer lands here instead of being freed,
/// so a quick reopen of the same range does not hit the disk again. Only
/// ready, clean chunks are accepted.
pub struct ChunkCache {
    cache: LruCache<u32, CacheFileChunk>,
    memory_bytes: usize,
}

/// Snapshot of the cache fill level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCacheStats {
    pub entries: usize,
    pub memory_bytes: usize,
    pub max_entries: usize,
}

impl ChunkCache {
    /// Create a cache holding at most `max_entries` chunks
    ///
    /// # Arguments
    /// * `max_entries` - Capacity; zero is treated as one
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
            memory_bytes: 0,
        }
    }

    /// Remember a released chunk
    ///
    /// Returns the chunk that was pushed out to make room, if any.
    pub fn put(&mut self, chunk: CacheFileChunk) -> Option<CacheFileChunk> {
        self.memory_bytes += chunk.memory_size();
        let evicted = match self.cache.push(chunk.index(), chunk) {
            Some((_, old)) => {
                self.memory_bytes -= old.memory_size();
                Some(old)
            }
            None => None,
        };

        if let Some(old) = &evicted {
            tracing::trace!("Chunk {} dropped from released-chunk cache", old.index());
        }
        evicted
    }

    /// Take a chunk back out for reuse
    pub fn take(&mut self, index: u32) -> Option<CacheFileChunk> {
        let chunk = self.cache.pop(&index)?;
        self.memory_bytes -= chunk.memory_size();
        Some(chunk)
    }

    pub fn contains(&self, index: u32) -> bool {
        self.cache.contains(&index)
    }

    /// Forget every chunk at or past `index`
    pub fn invalidate_from(&mut self, index: u32) {
        let stale: Vec<u32> = self
            .cache
            .iter()
            .filter(|(k, _)| **k >= index)
            .map(|(k, _)| *k)
            .collect();

        for key in stale {
            self.take(key);
        }
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.memory_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn memory_bytes(&self) -> usize {
        self.memory_bytes
    }

    pub fn stats(&self) -> ChunkCacheStats {
        ChunkCacheStats {
            entries: self.cache.len(),
            memory_bytes: self.memory_bytes,
            max_entries: self.cache.cap().get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: u32, len: usize) -> CacheFileChunk {
        let mut chunk = CacheFileChunk::new_ready(index);
        chunk.write(0, &vec![index as u8; len]).unwrap();
        chunk.set_dirty(false);
        chunk
    }

    #[test]
    fn test_put_and_take() {
        let mut cache = ChunkCache::new(4);
        assert!(cache.put(chunk(1, 100)).is_none());
        assert!(cache.contains(1));
        assert_eq!(cache.memory_bytes(), 512);

        let revived = cache.take(1).unwrap();
        assert_eq!(revived.data(), vec![1u8; 100].as_slice());
        assert!(cache.is_empty());
        assert_eq!(cache.memory_bytes(), 0);
        assert!(cache.take(1).is_none());
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = ChunkCache::new(2);
        cache.put(chunk(0, 10));
        cache.put(chunk(1, 10));
        // Touch chunk 0 so chunk 1 becomes the oldest
        let touched = cache.take(0).unwrap();
        cache.put(touched);

        let evicted = cache.put(chunk(2, 10)).unwrap();
        assert_eq!(evicted.index(), 1);
        assert_eq!(cache.stats().entries, 2);
        assert_eq!(cache.stats().max_entries, 2);
    }

    #[test]
    fn test_invalidate_from() {
        let mut cache = ChunkCache::new(8);
        for i in 0..5 {
            cache.put(chunk(i, 10));
        }
        cache.invalidate_from(3);
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(3));
        assert!(!cache.contains(4));
        assert!(cache.contains(2));
    }
}
