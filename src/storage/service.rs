//! The process-wide registry of cache entries
//!
//! Entries live in one table per load context, keyed by `[idExt:]uri`.
//! Entries that must not reach the disk are also listed in a parallel
//! memory-only table of the same context.
//!
//! Purging, registration and memory accounting run on the management
//! thread. Consumer callbacks run on the callback thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::instrument;

use super::cache_storage::CacheStorage;
use super::context::{CacheUri, LoadContextInfo};
use super::event_thread::EventThread;
use super::pool::MemoryPool;
use crate::config::CacheConfig;
use crate::constants::{CALLBACK_THREAD_NAME, MANAGEMENT_THREAD_NAME};
use crate::entry::{
    CacheEntry, CacheEntryDoomCallback, CacheEntryInfo, CacheStorageVisitor, PurgeWhat,
};
use crate::error::{CacheError, CacheResult};
use crate::file::metadata::now_secs;
use crate::io::{CacheFileIoListener, CacheFileIoManager};

type EntryTable = HashMap<String, Arc<CacheEntry>>;

#[derive(Default)]
struct Tables {
    /// Context key -> every entry of that context
    global: HashMap<String, EntryTable>,
    /// Context key -> entries kept in memory only
    memory_only: HashMap<String, EntryTable>,
}

impl Tables {
    fn record_memory_only(&mut self, entry: &Arc<CacheEntry>, only_in_memory: bool, overwrite: bool) {
        let key = entry.entry_key();
        if only_in_memory {
            let table = self
                .memory_only
                .entry(entry.storage_id().to_string())
                .or_default();
            if overwrite || !table.contains_key(&key) {
                table.insert(key, entry.clone());
            }
        } else if let Some(table) = self.memory_only.get_mut(entry.storage_id()) {
            remove_exact(table, &key, entry);
        }
    }

    fn remove(&mut self, entry: &Arc<CacheEntry>) -> bool {
        let key = entry.entry_key();
        let removed = self
            .global
            .get_mut(entry.storage_id())
            .map(|table| remove_exact(table, &key, entry))
            .unwrap_or(false);
        if let Some(table) = self.memory_only.get_mut(entry.storage_id()) {
            remove_exact(table, &key, entry);
        }
        removed
    }
}

/// Remove `key` only when it still maps to `entry`
fn remove_exact(table: &mut EntryTable, key: &str, entry: &Arc<CacheEntry>) -> bool {
    match table.get(key) {
        Some(existing) if Arc::ptr_eq(existing, entry) => {
            table.remove(key);
            true
        }
        _ => false,
    }
}

/// Owner of every entry, the purge logic and the service threads
///
/// Constructed once at start-up and passed to whoever needs it; dropping
/// the last reference (or calling [`shutdown`](Self::shutdown)) stops the
/// threads.
pub struct CacheStorageService {
    config: CacheConfig,
    memory_limit: AtomicU64,
    io: Arc<CacheFileIoManager>,
    management: EventThread,
    callbacks: EventThread,
    tables: Mutex<Tables>,
    pool: Mutex<MemoryPool>,
    purging: AtomicBool,
    shutdown: AtomicBool,
    self_ref: Weak<CacheStorageService>,
}

impl CacheStorageService {
    /// Start the service and its I/O, management and callback threads
    ///
    /// # Arguments
    /// * `config` - Validated before use; without `storage.cache_dir` every
    ///   entry stays in memory
    pub fn new(config: CacheConfig) -> CacheResult<Arc<Self>> {
        config
            .validate()
            .map_err(|e| CacheError::InvalidArgument(e.to_string()))?;

        let io = CacheFileIoManager::init(config.storage.cache_dir.clone())?;
        let management = EventThread::new(MANAGEMENT_THREAD_NAME)?;
        let callbacks = EventThread::new(CALLBACK_THREAD_NAME)?;
        let memory_limit = config.memory_limit_bytes();

        tracing::info!(
            "Cache storage service started (memory limit: {} bytes, cache dir: {:?})",
            memory_limit,
            config.storage.cache_dir
        );

        Ok(Arc::new_cyclic(|self_ref| Self {
            config,
            memory_limit: AtomicU64::new(memory_limit),
            io,
            management,
            callbacks,
            tables: Mutex::new(Tables::default()),
            pool: Mutex::new(MemoryPool::new()),
            purging: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        }))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn io(&self) -> &Arc<CacheFileIoManager> {
        &self.io
    }

    fn this(&self) -> CacheResult<Arc<Self>> {
        self.self_ref.upgrade().ok_or(CacheError::NotInitialized)
    }

    fn check_running(&self) -> CacheResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(CacheError::NotInitialized);
        }
        Ok(())
    }

    /// Storage whose entries never touch the disk
    pub fn memory_cache_storage(self: &Arc<Self>, info: &LoadContextInfo) -> CacheStorage {
        CacheStorage::new(self.clone(), *info, false)
    }

    /// Storage persisting its entries under the cache directory
    pub fn disk_cache_storage(self: &Arc<Self>, info: &LoadContextInfo) -> CacheStorage {
        CacheStorage::new(self.clone(), *info, true)
    }

    // ---- threads ----

    pub fn is_on_management_thread(&self) -> bool {
        self.management.is_current_thread()
    }

    pub fn is_on_callback_thread(&self) -> bool {
        self.callbacks.is_current_thread()
    }

    /// Run `task` on the management thread
    pub fn dispatch<F>(&self, task: F) -> CacheResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.management.dispatch(task)
    }

    /// Run `task` on the callback thread
    pub fn dispatch_callback<F>(&self, task: F) -> CacheResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.callbacks.dispatch(task)
    }

    // ---- tables ----

    /// Look up, create or replace the entry for `uri`
    ///
    /// A memory-only entry missing from the memory-only table was purged and
    /// is replaced even when `replace` is unset. A replaced entry is doomed
    /// once the lock is released.
    ///
    /// # Arguments
    /// * `storage_id` - Context key of the storage
    /// * `uri` - Resource identifier
    /// * `id_extension` - Distinguishes entries of one URI
    /// * `write_to_disk` - Persistence requested by the storage
    /// * `create` - Create the entry when missing
    /// * `replace` - Throw any existing entry away
    #[instrument(level = "trace", skip(self, uri), fields(uri = %uri))]
    pub fn add_storage_entry(
        &self,
        storage_id: &str,
        uri: &CacheUri,
        id_extension: &str,
        write_to_disk: bool,
        create: bool,
        replace: bool,
    ) -> CacheResult<Option<Arc<CacheEntry>>> {
        self.check_running()?;
        let entry_key = CacheEntry::hashing_key("", id_extension, uri);

        let (entry, replaced) = {
            let mut tables = self.tables.lock();
            let mut replace = replace;

            let existing = tables
                .global
                .get(storage_id)
                .and_then(|table| table.get(&entry_key))
                .cloned();

            if let Some(existing) = &existing {
                if !replace && !existing.use_disk() {
                    let listed = tables
                        .memory_only
                        .get(storage_id)
                        .and_then(|table| table.get(&entry_key))
                        .is_some_and(|e| Arc::ptr_eq(e, existing));
                    if !listed {
                        tracing::debug!(
                            "Memory-only entry {} was purged, replacing",
                            existing.key()
                        );
                        replace = true;
                    }
                }
            }

            let mut replaced = None;
            let mut entry = existing;
            if replace {
                if let Some(existing) = entry.take() {
                    tables.remove(&existing);
                    replaced = Some(existing);
                }
            }

            if let Some(existing) = &entry {
                if existing.set_use_disk(write_to_disk) {
                    tables.record_memory_only(existing, !write_to_disk, true);
                }
            } else if create {
                let created = CacheEntry::new(
                    storage_id,
                    uri.clone(),
                    id_extension,
                    write_to_disk,
                    self.self_ref.clone(),
                );
                tables
                    .global
                    .entry(storage_id.to_string())
                    .or_default()
                    .insert(entry_key.clone(), created.clone());
                tables.record_memory_only(&created, !write_to_disk, false);
                tracing::debug!("Created entry {} in storage '{}'", uri, storage_id);
                entry = Some(created);
            }

            (entry, replaced)
        };

        if let Some(replaced) = replaced {
            tracing::debug!("Dooming replaced entry {}", replaced.key());
            replaced.doom_already_removed();
        }

        Ok(entry)
    }

    /// Drop `entry` from its tables; a different entry under the same key
    /// stays
    pub fn remove_entry(&self, entry: &Arc<CacheEntry>) -> bool {
        let removed = self.tables.lock().remove(entry);
        if removed {
            tracing::trace!("Removed entry {} from tables", entry.key());
        }
        removed
    }

    pub(crate) fn set_entry_persistence(&self, entry: &Arc<CacheEntry>, persist: bool) {
        let mut tables = self.tables.lock();
        entry.set_use_disk(persist);
        tables.record_memory_only(entry, !persist, false);
    }

    /// Number of entries across every context
    pub fn entry_count(&self) -> usize {
        self.tables.lock().global.values().map(|t| t.len()).sum()
    }

    // ---- management thread ----

    pub(crate) fn register_entry(&self, entry: &Arc<CacheEntry>) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        if self.pool.lock().register(entry) {
            tracing::trace!("Registered {}", entry.key());
        }
    }

    pub(crate) fn unregister_entry(&self, entry: &Arc<CacheEntry>) {
        self.pool.lock().unregister(entry);
    }

    /// Record the new memory footprint of `entry` and purge when the total
    /// grew past the limit
    pub fn on_memory_consumption_change(&self, entry: &Arc<CacheEntry>, size: u64) {
        let over = self
            .pool
            .lock()
            .on_memory_consumption_change(entry, size, self.memory_limit());
        if !over {
            return;
        }

        if self.is_on_management_thread() {
            self.purge_over_memory_limit();
        } else if let Ok(this) = self.this() {
            if let Err(e) = self.dispatch(move || this.purge_over_memory_limit()) {
                tracing::debug!("Cannot schedule purge: {}", e);
            }
        }
    }

    pub fn memory_consumption(&self) -> u64 {
        self.pool.lock().memory_consumption()
    }

    pub fn memory_limit(&self) -> u64 {
        self.memory_limit.load(Ordering::Relaxed)
    }

    /// Change the memory ceiling, purging right away when now over it
    pub fn set_memory_limit_kb(&self, limit_kb: u64) -> CacheResult<()> {
        if limit_kb == 0 {
            return Err(CacheError::InvalidArgument(
                "memory limit must be greater than zero".to_string(),
            ));
        }
        self.memory_limit.store(limit_kb * 1024, Ordering::Relaxed);
        tracing::info!("Memory limit set to {} KB", limit_kb);

        let this = self.this()?;
        self.dispatch(move || this.purge_over_memory_limit())
    }

    fn over_limit(&self) -> bool {
        self.pool.lock().is_over(self.memory_limit())
    }

    /// Cheapest purges first: expired entries, cached data of disk
    /// entries, whole disk entries, then anything
    fn purge_over_memory_limit(&self) {
        if self.purging.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(
            "Purging, consumption {} over limit {}",
            self.memory_consumption(),
            self.memory_limit()
        );

        if self.over_limit() {
            self.purge_expired();
        }

        let mut force_sort = true;
        for what in [
            PurgeWhat::DataOnlyDiskBacked,
            PurgeWhat::WholeOnlyDiskBacked,
            PurgeWhat::Whole,
        ] {
            if !self.over_limit() {
                break;
            }
            self.purge_by_frecency(what, force_sort);
            force_sort = false;
        }

        tracing::debug!("Purge done, consumption {}", self.memory_consumption());
        self.purging.store(false, Ordering::Release);
    }

    fn purge_expired(&self) {
        let now = now_secs();
        let entries = self.pool.lock().by_expiration();
        for entry in entries {
            if !self.over_limit() || entry.sorting_expiration_time() > now {
                break;
            }
            tracing::debug!("Purging expired entry {}", entry.key());
            entry.purge_and_doom();
        }
    }

    fn purge_by_frecency(&self, what: PurgeWhat, force_sort: bool) {
        let entries = self.pool.lock().by_frecency(force_sort);
        for entry in entries {
            if !self.over_limit() {
                break;
            }
            entry.purge(what);
        }
    }

    /// Purge every registered entry as far as `what` allows
    pub fn purge_from_memory(&self, what: PurgeWhat) -> CacheResult<()> {
        let this = self.this()?;
        self.dispatch(move || {
            let entries = this.pool.lock().by_frecency(false);
            let mut removed = 0;
            for entry in entries {
                if entry.purge(what) {
                    removed += 1;
                }
            }
            tracing::info!("Purged {} entries from memory ({:?})", removed, what);
        })
    }

    // ---- doom ----

    /// Doom every entry of a storage
    ///
    /// The tables are detached at once; dooming runs in batches on the
    /// management thread and `callback` fires when all are gone.
    pub fn doom_storage_entries(
        &self,
        context_key: &str,
        disk_storage: bool,
        callback: Option<Arc<dyn CacheEntryDoomCallback>>,
    ) -> CacheResult<()> {
        self.check_running()?;

        let entries: Vec<Arc<CacheEntry>> = {
            let mut tables = self.tables.lock();
            if disk_storage {
                tables.memory_only.remove(context_key);
                tables
                    .global
                    .remove(context_key)
                    .map(|t| t.into_values().collect())
                    .unwrap_or_default()
            } else {
                let entries: Vec<_> = tables
                    .memory_only
                    .remove(context_key)
                    .map(|t| t.into_values().collect())
                    .unwrap_or_default();
                if let Some(global) = tables.global.get_mut(context_key) {
                    for entry in &entries {
                        remove_exact(global, &entry.entry_key(), entry);
                    }
                }
                entries
            }
        };

        tracing::info!(
            "Dooming {} entries of storage '{}' (disk: {})",
            entries.len(),
            context_key,
            disk_storage
        );

        let this = self.this()?;
        self.dispatch(move || this.run_eviction(entries, callback))
    }

    fn run_eviction(
        self: Arc<Self>,
        mut entries: Vec<Arc<CacheEntry>>,
        callback: Option<Arc<dyn CacheEntryDoomCallback>>,
    ) {
        let batch = self.config.eviction.purge_batch_size;
        let rest = if entries.len() > batch {
            entries.split_off(batch)
        } else {
            Vec::new()
        };

        for entry in entries {
            entry.doom_already_removed();
        }

        if !rest.is_empty() {
            tracing::trace!("{} entries left to doom", rest.len());
            let this = self.clone();
            if let Err(e) = self.dispatch(move || this.run_eviction(rest, callback)) {
                tracing::warn!("Eviction interrupted: {}", e);
            }
            return;
        }

        if let Some(callback) = callback {
            if let Err(e) = self.dispatch_callback(move || callback.on_cache_entry_doomed(Ok(())))
            {
                tracing::debug!("Cannot notify eviction: {}", e);
            }
        }
    }

    /// Doom one URI of a storage, loaded or not
    pub fn doom_uri(
        &self,
        context_key: &str,
        uri: &CacheUri,
        id_extension: &str,
        disk_storage: bool,
        callback: Option<Arc<dyn CacheEntryDoomCallback>>,
    ) -> CacheResult<()> {
        self.check_running()?;
        let entry_key = CacheEntry::hashing_key("", id_extension, uri);

        let entry = {
            let tables = self.tables.lock();
            let table = if disk_storage {
                tables.global.get(context_key)
            } else {
                tables.memory_only.get(context_key)
            };
            table.and_then(|t| t.get(&entry_key)).cloned()
        };

        if let Some(entry) = entry {
            tracing::debug!("Dooming loaded entry {}", uri);
            return entry.async_doom(callback);
        }

        if !disk_storage {
            return Err(CacheError::NotAvailable);
        }

        // Not in memory; the file may still exist
        let file_key = CacheEntry::hashing_key(context_key, id_extension, uri);
        let listener = callback.map(|callback| {
            Arc::new(DoomFileListener {
                service: self.self_ref.clone(),
                callback,
            }) as Arc<dyn CacheFileIoListener>
        });
        self.io.doom_file_by_key(&file_key, listener)
    }

    /// Doom every entry and remove every file of the cache directory
    pub fn clear(&self) -> CacheResult<()> {
        let contexts: Vec<String> = self.tables.lock().global.keys().cloned().collect();
        tracing::info!("Clearing cache ({} storages)", contexts.len());
        for context in contexts {
            self.doom_storage_entries(&context, true, None)?;
        }

        if self.io.cache_dir().is_some() {
            self.io.evict_all(None)?;
        }
        Ok(())
    }

    /// Doom the entries of every private context
    pub fn drop_private_browsing_entries(&self) -> CacheResult<()> {
        let private: Vec<String> = self
            .tables
            .lock()
            .global
            .keys()
            .filter(|key| {
                LoadContextInfo::from_key(key)
                    .map(|info| info.private)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        for context in private {
            tracing::debug!("Dropping private storage '{}'", context);
            self.doom_storage_entries(&context, true, None)?;
        }
        Ok(())
    }

    // ---- visiting ----

    /// Report a storage's totals and, with `visit_entries`, each entry
    pub fn visit_storage(
        &self,
        context_key: &str,
        disk_storage: bool,
        visitor: Arc<dyn CacheStorageVisitor>,
        visit_entries: bool,
    ) -> CacheResult<()> {
        self.check_running()?;
        let this = self.this()?;
        let context_key = context_key.to_string();

        self.dispatch(move || {
            let entries: Vec<Arc<CacheEntry>> = {
                let tables = this.tables.lock();
                let table = if disk_storage {
                    tables.global.get(&context_key)
                } else {
                    tables.memory_only.get(&context_key)
                };
                table
                    .map(|t| t.values().cloned().collect())
                    .unwrap_or_default()
            };

            let consumption: u64 = entries.iter().map(|e| e.reported_memory()).sum();
            let capacity = this.memory_limit();
            let infos: Vec<CacheEntryInfo> = if visit_entries {
                entries.iter().map(|e| e.info()).collect()
            } else {
                Vec::new()
            };
            let count = entries.len();

            let dispatched = this.dispatch_callback(move || {
                visitor.on_cache_storage_info(count, consumption, capacity);
                for info in &infos {
                    visitor.on_cache_entry_info(info);
                }
                visitor.on_cache_entry_visit_completed();
            });
            if let Err(e) = dispatched {
                tracing::debug!("Cannot deliver visit: {}", e);
            }
        })
    }

    // ---- lifecycle ----

    /// Stop the threads and release every entry
    ///
    /// Queued tasks still run. Files are flushed and closed by the I/O
    /// manager before it stops.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Shutting down cache storage service");

        self.management.shutdown();
        self.callbacks.shutdown();

        let tables = std::mem::take(&mut *self.tables.lock());
        let pooled = self.pool.lock().clear();
        drop(tables);
        drop(pooled);

        self.io.shutdown();
    }
}

impl Drop for CacheStorageService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Forwards the doom of an unloaded file to a consumer
struct DoomFileListener {
    service: Weak<CacheStorageService>,
    callback: Arc<dyn CacheEntryDoomCallback>,
}

impl CacheFileIoListener for DoomFileListener {
    fn on_file_doomed(&self, result: CacheResult<()>) {
        let Some(service) = self.service.upgrade() else {
            return;
        };
        let callback = self.callback.clone();
        if let Err(e) = service.dispatch_callback(move || callback.on_cache_entry_doomed(result)) {
            tracing::debug!("Cannot notify doom: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service() -> Arc<CacheStorageService> {
        CacheStorageService::new(CacheConfig::default()).unwrap()
    }

    fn uri(s: &str) -> CacheUri {
        CacheUri::parse(s).unwrap()
    }

    #[test]
    fn test_add_storage_entry_returns_same_entry() {
        let service = service();
        let a = service
            .add_storage_entry("", &uri("http://a/"), "", true, true, false)
            .unwrap()
            .unwrap();
        let b = service
            .add_storage_entry("", &uri("http://a/"), "", true, true, false)
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(service.entry_count(), 1);
        service.shutdown();
    }

    #[test]
    fn test_contexts_and_extensions_are_separate() {
        let service = service();
        let plain = service
            .add_storage_entry("", &uri("http://a/"), "", true, true, false)
            .unwrap()
            .unwrap();
        let private = service
            .add_storage_entry("p,", &uri("http://a/"), "", true, true, false)
            .unwrap()
            .unwrap();
        let ext = service
            .add_storage_entry("", &uri("http://a/"), "x", true, true, false)
            .unwrap()
            .unwrap();
        assert!(!Arc::ptr_eq(&plain, &private));
        assert!(!Arc::ptr_eq(&plain, &ext));
        assert_eq!(service.entry_count(), 3);
        service.shutdown();
    }

    #[test]
    fn test_lookup_without_create() {
        let service = service();
        let missing = service
            .add_storage_entry("", &uri("http://a/"), "", true, false, false)
            .unwrap();
        assert!(missing.is_none());
        service.shutdown();
    }

    #[test]
    fn test_replace_dooms_old_entry() {
        let service = service();
        let old = service
            .add_storage_entry("", &uri("http://a/"), "", true, true, false)
            .unwrap()
            .unwrap();
        let new = service
            .add_storage_entry("", &uri("http://a/"), "", true, true, true)
            .unwrap()
            .unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(old.is_doomed());
        assert!(!service.remove_entry(&old));
        assert!(service.remove_entry(&new));
        service.shutdown();
    }

    #[test]
    fn test_purged_memory_only_entry_is_replaced() {
        let service = service();
        let old = service
            .add_storage_entry("", &uri("http://m/"), "", false, true, false)
            .unwrap()
            .unwrap();

        // Drop it from the memory-only table only
        service
            .tables
            .lock()
            .memory_only
            .get_mut("")
            .unwrap()
            .clear();

        let new = service
            .add_storage_entry("", &uri("http://m/"), "", false, true, false)
            .unwrap()
            .unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        service.shutdown();
    }

    #[test]
    fn test_add_after_shutdown_fails() {
        let service = service();
        service.shutdown();
        assert!(matches!(
            service.add_storage_entry("", &uri("http://a/"), "", true, true, false),
            Err(CacheError::NotInitialized)
        ));
    }

    #[test]
    fn test_clear_with_cache_dir() {
        let dir = TempDir::new().unwrap();
        let service = CacheStorageService::new(CacheConfig::with_cache_dir(dir.path())).unwrap();
        service
            .add_storage_entry("", &uri("http://a/"), "", true, true, false)
            .unwrap();
        service.clear().unwrap();
        assert_eq!(service.entry_count(), 0);
        service.shutdown();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = CacheConfig::default();
        config.memory.limit_kb = 0;
        assert!(matches!(
            CacheStorageService::new(config),
            Err(CacheError::InvalidArgument(_))
        ));
    }
}
