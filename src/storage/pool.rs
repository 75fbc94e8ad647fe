//! Registered entries ordered for purging
//!
//! Only touched on the management thread (the service wraps it in a
//! mutex so that visitors can read totals).

use std::sync::Arc;

use crate::entry::CacheEntry;

#[derive(Default)]
pub struct MemoryPool {
    frecency_array: Vec<Arc<CacheEntry>>,
    expiration_array: Vec<Arc<CacheEntry>>,
    memory_consumption: u64,
    needs_sort: bool,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the entry to both arrays; entries register at most once
    pub fn register(&mut self, entry: &Arc<CacheEntry>) -> bool {
        if !entry.can_register() {
            return false;
        }
        self.frecency_array.push(entry.clone());
        self.expiration_array.push(entry.clone());
        self.needs_sort = true;
        entry.set_registered(true);
        true
    }

    pub fn unregister(&mut self, entry: &Arc<CacheEntry>) {
        if entry.is_registered() {
            self.frecency_array.retain(|e| !Arc::ptr_eq(e, entry));
            self.expiration_array.retain(|e| !Arc::ptr_eq(e, entry));
        }
        // Forbid registration even when it never happened
        entry.set_registered(false);
    }

    /// Apply a new memory report of `entry`
    ///
    /// Returns `true` when consumption grew past `limit`.
    pub fn on_memory_consumption_change(
        &mut self,
        entry: &CacheEntry,
        size: u64,
        limit: u64,
    ) -> bool {
        let previous = entry.reported_memory();
        if size == previous {
            return false;
        }
        // A gone entry may only shrink
        if size > previous && !entry.is_registered() {
            return false;
        }

        entry.set_reported_memory(size);
        self.memory_consumption = self.memory_consumption.saturating_sub(previous) + size;
        tracing::trace!(
            "Memory consumption {} ({} -> {} for {})",
            self.memory_consumption,
            previous,
            size,
            entry.key()
        );

        size > previous && self.memory_consumption > limit
    }

    pub fn memory_consumption(&self) -> u64 {
        self.memory_consumption
    }

    pub fn is_over(&self, limit: u64) -> bool {
        self.memory_consumption > limit
    }

    pub fn len(&self) -> usize {
        self.frecency_array.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frecency_array.is_empty()
    }

    /// Registered entries by ascending expiration time
    pub fn by_expiration(&mut self) -> Vec<Arc<CacheEntry>> {
        self.expiration_array.sort_by_key(|e| e.sorting_expiration_time());
        self.expiration_array.clone()
    }

    /// Registered entries by ascending frecency
    ///
    /// Sorts only when something changed since the last call with
    /// `force_sort` unset.
    pub fn by_frecency(&mut self, force_sort: bool) -> Vec<Arc<CacheEntry>> {
        if force_sort || self.needs_sort {
            self.frecency_array.sort_by(|a, b| a.frecency().total_cmp(&b.frecency()));
            self.needs_sort = false;
        }
        self.frecency_array.clone()
    }

    pub fn clear(&mut self) -> Vec<Arc<CacheEntry>> {
        self.expiration_array.clear();
        self.memory_consumption = 0;
        std::mem::take(&mut self.frecency_array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CacheUri;
    use std::sync::Weak;

    fn entry(uri: &str) -> Arc<CacheEntry> {
        CacheEntry::new("", CacheUri::parse(uri).unwrap(), "", true, Weak::new())
    }

    #[test]
    fn test_register_once() {
        let mut pool = MemoryPool::new();
        let e = entry("http://a/");
        assert!(pool.register(&e));
        assert!(!pool.register(&e));
        assert_eq!(pool.len(), 1);

        pool.unregister(&e);
        assert!(pool.is_empty());
        assert!(!pool.register(&e));
    }

    #[test]
    fn test_consumption_tracking() {
        let mut pool = MemoryPool::new();
        let e = entry("http://a/");
        pool.register(&e);

        assert!(!pool.on_memory_consumption_change(&e, 500, 1000));
        assert_eq!(pool.memory_consumption(), 500);
        assert!(pool.on_memory_consumption_change(&e, 1500, 1000));
        assert_eq!(pool.memory_consumption(), 1500);
        assert!(!pool.on_memory_consumption_change(&e, 200, 1000));
        assert_eq!(pool.memory_consumption(), 200);
    }

    #[test]
    fn test_unregistered_entry_may_only_shrink() {
        let mut pool = MemoryPool::new();
        let e = entry("http://a/");
        pool.register(&e);
        pool.on_memory_consumption_change(&e, 300, 1000);
        pool.unregister(&e);

        assert!(!pool.on_memory_consumption_change(&e, 900, 1000));
        assert_eq!(pool.memory_consumption(), 300);
        pool.on_memory_consumption_change(&e, 0, 1000);
        assert_eq!(pool.memory_consumption(), 0);
    }
}
