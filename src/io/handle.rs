//! File handles and the hash keyed handle registry

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::hash::CacheHash;

/// In-memory handle to an entry file that may not exist on disk yet
///
/// The registry owns the handle. Consumers (files, chunks, metadata
/// readers) hold a clone of the `Arc` as a token and give it back with
/// [`CacheFileIoManager::release_handle`](super::CacheFileIoManager::release_handle).
/// The descriptor is only ever touched on the I/O thread.
pub struct CacheFileHandle {
    hash: CacheHash,
    priority: bool,
    state: Mutex<HandleState>,
}

pub(crate) struct HandleState {
    pub file: Option<File>,
    pub path: PathBuf,
    pub file_size: u64,
    /// Whether a file exists on disk for this handle
    pub file_exists: bool,
    pub doomed: bool,
    /// Consumers that have not released the handle yet
    pub consumers: usize,
    /// Set once the handle was closed and delisted
    pub closed: bool,
}

impl CacheFileHandle {
    pub(crate) fn new(hash: CacheHash, path: PathBuf, priority: bool) -> Self {
        Self {
            hash,
            priority,
            state: Mutex::new(HandleState {
                file: None,
                path,
                file_size: 0,
                file_exists: false,
                doomed: false,
                consumers: 0,
                closed: false,
            }),
        }
    }

    pub fn hash(&self) -> &CacheHash {
        &self.hash
    }

    pub fn is_priority(&self) -> bool {
        self.priority
    }

    pub fn is_doomed(&self) -> bool {
        self.state.lock().doomed
    }

    /// Current size of the backing file
    pub fn file_size(&self) -> u64 {
        self.state.lock().file_size
    }

    /// Current location of the backing file
    pub fn path(&self) -> PathBuf {
        self.state.lock().path.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock()
    }
}

impl std::fmt::Debug for CacheFileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CacheFileHandle")
            .field("hash", &self.hash)
            .field("doomed", &state.doomed)
            .field("file_size", &state.file_size)
            .field("consumers", &state.consumers)
            .finish()
    }
}

/// Registry of open handles keyed by content hash
///
/// Several handles may share a hash only while all but the newest are
/// doomed; lookups skip doomed handles.
#[derive(Default)]
pub struct HandleRegistry {
    handles: HashMap<CacheHash, Vec<Arc<CacheFileHandle>>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live (non doomed) handle for `hash`
    pub fn get_handle(&self, hash: &CacheHash) -> Option<Arc<CacheFileHandle>> {
        self.handles
            .get(hash)?
            .iter()
            .find(|h| !h.is_doomed())
            .cloned()
    }

    /// Register a fresh handle in front of any doomed ones
    pub fn new_handle(
        &mut self,
        hash: CacheHash,
        path: &Path,
        priority: bool,
    ) -> Arc<CacheFileHandle> {
        let handle = Arc::new(CacheFileHandle::new(hash, path.to_path_buf(), priority));
        self.handles.entry(hash).or_default().insert(0, handle.clone());
        handle
    }

    pub fn remove_handle(&mut self, handle: &Arc<CacheFileHandle>) {
        if let Some(list) = self.handles.get_mut(handle.hash()) {
            list.retain(|h| !Arc::ptr_eq(h, handle));
            if list.is_empty() {
                self.handles.remove(handle.hash());
            }
        }
    }

    pub fn all_handles(&self) -> Vec<Arc<CacheFileHandle>> {
        self.handles.values().flatten().cloned().collect()
    }

    /// Number of non doomed handles registered for `hash`
    pub fn live_handle_count(&self, hash: &CacheHash) -> usize {
        self.handles
            .get(hash)
            .map(|list| list.iter().filter(|h| !h.is_doomed()).count())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.handles.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> PathBuf {
        PathBuf::from("/tmp/cache2/entries/x")
    }

    #[test]
    fn test_lookup_skips_doomed() {
        let mut registry = HandleRegistry::new();
        let hash = CacheHash::from_key("a");

        let first = registry.new_handle(hash, &path(), false);
        assert!(Arc::ptr_eq(&registry.get_handle(&hash).unwrap(), &first));

        first.state().doomed = true;
        assert!(registry.get_handle(&hash).is_none());

        let second = registry.new_handle(hash, &path(), false);
        assert!(Arc::ptr_eq(&registry.get_handle(&hash).unwrap(), &second));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.live_handle_count(&hash), 1);

        registry.remove_handle(&first);
        registry.remove_handle(&second);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handles_are_per_hash() {
        let mut registry = HandleRegistry::new();
        let a = CacheHash::from_key("a");
        let b = CacheHash::from_key("b");
        registry.new_handle(a, &path(), false);
        registry.new_handle(b, &path(), true);

        assert!(!registry.get_handle(&a).unwrap().is_priority());
        assert!(registry.get_handle(&b).unwrap().is_priority());
        assert_eq!(registry.all_handles().len(), 2);
    }
}
