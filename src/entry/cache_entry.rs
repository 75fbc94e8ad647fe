//! The externally visible cache entry
//!
//! An entry is loaded at most once, then serves its queued open callbacks:
//! writers (non read-only consumers) first, in FIFO order, then read-only
//! consumers. While one consumer holds the writer handle every other
//! callback stays queued.
//!
//! Work that touches service-wide structures (registration, frecency,
//! memory accounting, doom) runs on the management thread. Requests from
//! other threads are collected in [`Ops`] and dispatched once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::callback::{
    CacheEntryDoomCallback, CacheEntryInfo, CacheEntryOpenCallback, CheckResult, EntryAccess,
};
use super::ops::{now_usecs, update_frecency, Ops};
use crate::constants::SECURITY_INFO_ELEMENT;
use crate::error::{CacheError, CacheResult};
use crate::file::{
    CacheFile, CacheFileInputStream, CacheFileListener, CacheFileOutputStream, FileInit,
    NO_EXPIRATION_TIME,
};
use crate::storage::{CacheStorageService, CacheUri, OpenFlags};

pub type OpenCallback = Arc<dyn CacheEntryOpenCallback>;

/// What [`CacheEntry::purge`] may drop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeWhat {
    /// Cached chunk data of disk-backed entries; the entry stays
    DataOnlyDiskBacked,
    /// Whole disk-backed entries; their data remains on disk
    WholeOnlyDiskBacked,
    /// Any entry, memory-only ones included
    Whole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallbackResult {
    Invoked,
    /// Someone writes or revalidates; stop serving the queue
    Bypassed,
    /// The consumer rejected the entry
    Invalid,
}

/// How a callback is going to be served, decided under the entry lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    NotFound,
    Busy,
    Reader,
    Writer { id: u64, is_new: bool },
}

struct EntryState {
    loading: bool,
    loaded: bool,
    ready: bool,
    writing: bool,
    revalidating: bool,
    doomed: bool,
    prevent_callbacks: bool,
    callbacks: VecDeque<OpenCallback>,
    read_only_callbacks: VecDeque<OpenCallback>,
    doom_callback: Option<Arc<dyn CacheEntryDoomCallback>>,
    file: Option<Arc<CacheFile>>,
    ops: Ops,
    /// Id of the handle currently allowed to write
    writer: Option<u64>,
    next_writer_id: u64,
    security_info: Option<Option<String>>,
}

/// Bookkeeping owned by the management thread
#[derive(Debug, Default)]
struct Management {
    registered: bool,
    registration_forbidden: bool,
    reported_memory: u64,
}

pub struct CacheEntry {
    storage_id: String,
    uri: CacheUri,
    id_extension: String,
    /// Guarded by the service lock for writes
    use_disk: AtomicBool,
    service: Weak<CacheStorageService>,
    self_ref: Weak<CacheEntry>,
    state: Mutex<EntryState>,
    management: Mutex<Management>,
    /// f64 bits
    frecency: AtomicU64,
    sorting_expiration: AtomicU32,
    predicted_data_size: AtomicI64,
    file_memory: AtomicUsize,
}

impl CacheEntry {
    /// Create an unloaded entry
    ///
    /// # Arguments
    /// * `storage_id` - Salt of the load context the entry belongs to
    /// * `uri` - Resource identifier
    /// * `id_extension` - Distinguishes several entries for one URI
    /// * `use_disk` - Whether the content may be persisted
    /// * `service` - Owning service
    pub fn new(
        storage_id: &str,
        uri: CacheUri,
        id_extension: &str,
        use_disk: bool,
        service: Weak<CacheStorageService>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            storage_id: storage_id.to_string(),
            uri,
            id_extension: id_extension.to_string(),
            use_disk: AtomicBool::new(use_disk),
            service,
            self_ref: self_ref.clone(),
            state: Mutex::new(EntryState {
                loading: false,
                loaded: false,
                ready: false,
                writing: false,
                revalidating: false,
                doomed: false,
                prevent_callbacks: false,
                callbacks: VecDeque::new(),
                read_only_callbacks: VecDeque::new(),
                doom_callback: None,
                file: None,
                ops: Ops::new(),
                writer: None,
                next_writer_id: 1,
                security_info: None,
            }),
            management: Mutex::new(Management::default()),
            frecency: AtomicU64::new(0f64.to_bits()),
            sorting_expiration: AtomicU32::new(NO_EXPIRATION_TIME),
            predicted_data_size: AtomicI64::new(-1),
            file_memory: AtomicUsize::new(0),
        })
    }

    /// Key naming the entry's file: `[storage:][id_extension:]uri`
    pub fn hashing_key(storage_id: &str, id_extension: &str, uri: &CacheUri) -> String {
        let mut key = String::new();
        if !storage_id.is_empty() {
            key.push_str(storage_id);
            key.push(':');
        }
        if !id_extension.is_empty() {
            key.push_str(id_extension);
            key.push(':');
        }
        key.push_str(uri.as_str());
        key
    }

    /// Key inside the storage's entry table
    pub fn entry_key(&self) -> String {
        Self::hashing_key("", &self.id_extension, &self.uri)
    }

    pub fn hashing_key_with_storage(&self) -> String {
        Self::hashing_key(&self.storage_id, &self.id_extension, &self.uri)
    }

    /// The URI the entry was opened for
    pub fn key(&self) -> &str {
        self.uri.as_str()
    }

    pub fn uri(&self) -> &CacheUri {
        &self.uri
    }

    pub fn storage_id(&self) -> &str {
        &self.storage_id
    }

    pub fn id_extension(&self) -> &str {
        &self.id_extension
    }

    fn this(&self) -> Option<Arc<Self>> {
        self.self_ref.upgrade()
    }

    fn file(&self) -> CacheResult<Arc<CacheFile>> {
        self.state.lock().file.clone().ok_or(CacheError::NotAvailable)
    }

    // ---- open ----

    /// Ask for the entry on behalf of `callback`
    ///
    /// The first open triggers the load; the callback is served once the
    /// entry is loaded and no other consumer writes it.
    pub fn async_open(self: &Arc<Self>, callback: Option<OpenCallback>, flags: OpenFlags) {
        let read_only = flags.contains(OpenFlags::OPEN_READONLY);
        let truncate = flags.contains(OpenFlags::OPEN_TRUNCATE);
        let priority = flags.contains(OpenFlags::OPEN_PRIORITY);
        let bypass_if_busy = flags.contains(OpenFlags::OPEN_BYPASS_IF_BUSY);

        let (callback, busy) = {
            let mut st = self.state.lock();
            tracing::debug!(
                "CacheEntry::async_open {} (ready: {}, loaded: {}, writing: {})",
                self.key(),
                st.ready,
                st.loaded,
                st.writing
            );

            if !st.loaded {
                if let Some(callback) = callback {
                    if read_only {
                        st.read_only_callbacks.push_back(callback);
                    } else {
                        st.callbacks.push_back(callback);
                    }
                }
                let start_load = !st.loading;
                st.loading = true;
                drop(st);

                if start_load {
                    self.background_op(Ops::REGISTER, false);
                    self.load(truncate, priority);
                }
                return;
            }

            // A truncating open may come without a callback
            let Some(callback) = callback else {
                return;
            };
            (callback, st.writing || st.revalidating)
        };
        if bypass_if_busy && busy {
            self.invoke_available_callback(callback, Delivery::Busy);
            return;
        }

        match self.invoke_callback(&callback, read_only) {
            CallbackResult::Invoked => {}
            CallbackResult::Bypassed => self.remember_callback(callback, read_only),
            CallbackResult::Invalid => {
                if self.reopen_truncated(Some(callback.clone())).is_none() {
                    self.invoke_available_callback(callback, Delivery::NotFound);
                }
            }
        }
    }

    fn load(self: &Arc<Self>, truncate: bool, priority: bool) {
        tracing::debug!("CacheEntry::load {} (truncate: {})", self.key(), truncate);
        let use_disk = self.use_disk();

        let Some(service) = self.service.upgrade() else {
            self.on_file_ready(Err(CacheError::NotInitialized), true);
            return;
        };

        let file = {
            let mut st = self.state.lock();
            if truncate || !use_disk {
                st.loading = false;
                st.loaded = true;
            } else {
                st.loading = true;
                st.loaded = false;
            }
            let file = CacheFile::new(
                service.io().clone(),
                &self.hashing_key_with_storage(),
                service.config().memory.cached_chunks_limit,
            );
            st.file = Some(file.clone());
            file
        };

        let listener: Weak<dyn CacheFileListener> = self.self_ref.clone();
        match file.init(truncate, !use_disk, priority, listener) {
            Ok(FileInit::Ready) => self.on_file_ready(Ok(()), true),
            Ok(FileInit::Pending) => {}
            Err(e) => self.on_file_ready(Err(e), truncate || !use_disk),
        }
    }

    fn remember_callback(self: &Arc<Self>, callback: OpenCallback, read_only: bool) {
        let retry = {
            let mut st = self.state.lock();
            if read_only {
                st.read_only_callbacks.push_back(callback);
            } else {
                st.callbacks.push_back(callback);
            }
            !st.writing && !st.revalidating
        };

        // The writer went away before we queued
        if retry {
            self.background_op(Ops::CALLBACKS, true);
        }
    }

    /// Serve queued callbacks until one has to wait
    pub(crate) fn invoke_callbacks(self: &Arc<Self>) {
        tracing::trace!("CacheEntry::invoke_callbacks {}", self.key());

        loop {
            let callback = {
                let mut st = self.state.lock();
                if st.prevent_callbacks {
                    tracing::trace!("Callbacks of {} prevented", self.key());
                    return;
                }
                match st.callbacks.pop_front() {
                    Some(callback) => callback,
                    None => break,
                }
            };

            match self.invoke_callback(&callback, false) {
                CallbackResult::Invoked => {}
                CallbackResult::Bypassed => {
                    let retry = {
                        let mut st = self.state.lock();
                        st.callbacks.push_front(callback);
                        !st.writing && !st.revalidating
                    };
                    if retry {
                        self.background_op(Ops::CALLBACKS, true);
                    }
                    return;
                }
                CallbackResult::Invalid => {
                    if self.reopen_truncated(Some(callback.clone())).is_some() {
                        return;
                    }
                    // Renewal failed; the consumer has to learn about it
                    self.invoke_available_callback(callback, Delivery::NotFound);
                }
            }
        }

        loop {
            let callback = {
                let mut st = self.state.lock();
                if st.prevent_callbacks {
                    return;
                }
                match st.read_only_callbacks.pop_front() {
                    Some(callback) => callback,
                    None => break,
                }
            };

            if self.invoke_callback(&callback, true) == CallbackResult::Bypassed {
                self.state.lock().read_only_callbacks.push_front(callback);
                break;
            }
        }
    }

    fn invoke_callback(self: &Arc<Self>, callback: &OpenCallback, read_only: bool) -> CallbackResult {
        let (ready, doomed) = {
            let st = self.state.lock();
            if !st.doomed && (st.writing || st.revalidating) {
                tracing::trace!("{} is being written, callback bypassed", self.key());
                return CallbackResult::Bypassed;
            }
            (st.ready, st.doomed)
        };

        let mut revalidate = false;
        if !doomed && ready && !read_only {
            let validity = callback.on_cache_entry_check(self).unwrap_or_else(|e| {
                tracing::debug!("Entry check of {} failed: {}", self.key(), e);
                CheckResult::NotValid
            });
            tracing::trace!("Entry check of {}: {:?}", self.key(), validity);

            match validity {
                CheckResult::NotValid => return CallbackResult::Invalid,
                CheckResult::NeedsRevalidation => revalidate = true,
                CheckResult::Valid => {}
            }
        }

        let delivery = {
            let mut st = self.state.lock();
            if st.doomed {
                Delivery::NotFound
            } else if st.writing || st.revalidating {
                // Another consumer became the writer during the check
                return CallbackResult::Bypassed;
            } else if st.ready && !revalidate {
                Delivery::Reader
            } else if read_only {
                Delivery::NotFound
            } else {
                let id = st.next_writer_id;
                st.next_writer_id += 1;
                st.writing = true;
                st.revalidating = revalidate;
                st.writer = Some(id);
                Delivery::Writer {
                    id,
                    is_new: !st.ready,
                }
            }
        };

        self.invoke_available_callback(callback.clone(), delivery);
        CallbackResult::Invoked
    }

    /// Hand the entry to the consumer on the callback thread
    fn invoke_available_callback(self: &Arc<Self>, callback: OpenCallback, delivery: Delivery) {
        let Some(service) = self.service.upgrade() else {
            return;
        };

        if !service.is_on_callback_thread() {
            let this = self.clone();
            let dispatched = service
                .dispatch_callback(move || this.invoke_available_callback(callback, delivery));
            if let Err(e) = dispatched {
                tracing::warn!("Cannot dispatch callback of {}: {}", self.key(), e);
            }
            return;
        }

        let doomed = self.state.lock().doomed;
        if doomed && delivery != Delivery::Busy {
            tracing::debug!("{} doomed, notifying with KeyNotFound", self.key());
            if let Delivery::Writer { id, .. } = delivery {
                self.on_writer_closed(id);
            }
            let _ = callback.on_cache_entry_available(None, false, Err(CacheError::KeyNotFound));
            return;
        }

        match delivery {
            Delivery::NotFound => {
                let _ =
                    callback.on_cache_entry_available(None, false, Err(CacheError::KeyNotFound));
            }
            Delivery::Busy => {
                let _ =
                    callback.on_cache_entry_available(None, false, Err(CacheError::NotAvailable));
            }
            Delivery::Reader => {
                self.note_access();
                let access = EntryAccess::Reader(self.clone());
                if let Err(e) = callback.on_cache_entry_available(Some(access), false, Ok(())) {
                    tracing::debug!("Reader of {} failed: {}", self.key(), e);
                }
            }
            Delivery::Writer { id, is_new } => {
                self.note_access();
                let handle = CacheEntryHandle::new(self.clone(), id);
                let access = EntryAccess::Writer(handle);
                tracing::debug!("Handing {} to a writer (new: {})", self.key(), is_new);
                if let Err(e) = callback.on_cache_entry_available(Some(access), is_new, Ok(())) {
                    // The consumer could not take care of the entry
                    tracing::debug!("Writer of {} failed: {}", self.key(), e);
                    self.on_writer_closed(id);
                }
            }
        }
    }

    fn note_access(self: &Arc<Self>) {
        if let Ok(file) = self.file() {
            file.on_fetched();
        }
        self.background_op(Ops::FRECENCYUPDATE, false);
    }

    /// The writer with handle `id` is done
    pub(crate) fn on_writer_closed(self: &Arc<Self>, id: u64) {
        let file = {
            let mut st = self.state.lock();
            if st.writer != Some(id) {
                return;
            }
            tracing::debug!(
                "CacheEntry::on_writer_closed {} (ready: {})",
                self.key(),
                st.ready
            );
            st.writer = None;
            st.writing = false;
            st.revalidating = false;
            st.file.clone()
        };

        if let Some(file) = file {
            file.write_metadata_if_needed();
        }
        self.background_op(Ops::REPORTUSAGE, false);
        self.invoke_callbacks();
    }

    /// Replace this entry with a fresh truncated one
    ///
    /// Queued callbacks move to the new entry. Returns `None` when the
    /// service refused to create it.
    fn reopen_truncated(self: &Arc<Self>, callback: Option<OpenCallback>) -> Option<Arc<Self>> {
        tracing::debug!("CacheEntry::reopen_truncated {}", self.key());

        // Keep the doom below from serving our queue prematurely
        self.state.lock().prevent_callbacks = true;

        let new_entry = self.service.upgrade().and_then(|service| {
            match service.add_storage_entry(
                &self.storage_id,
                &self.uri,
                &self.id_extension,
                self.use_disk(),
                true,
                true,
            ) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Cannot replace {}: {}", self.key(), e);
                    None
                }
            }
        });

        if let Some(entry) = &new_entry {
            entry.async_open(callback, OpenFlags::OPEN_TRUNCATE);
        }

        let (callbacks, read_only) = {
            let mut st = self.state.lock();
            st.prevent_callbacks = false;
            if new_entry.is_none() {
                return None;
            }
            (
                std::mem::take(&mut st.callbacks),
                std::mem::take(&mut st.read_only_callbacks),
            )
        };

        let new_entry = new_entry?;
        new_entry.transfer_callbacks(callbacks, read_only);
        Some(new_entry)
    }

    fn transfer_callbacks(
        self: &Arc<Self>,
        callbacks: VecDeque<OpenCallback>,
        read_only: VecDeque<OpenCallback>,
    ) {
        let invoke = {
            let mut st = self.state.lock();
            st.callbacks.extend(callbacks);
            st.read_only_callbacks.extend(read_only);
            !st.callbacks.is_empty() || !st.read_only_callbacks.is_empty()
        };

        if invoke {
            self.background_op(Ops::CALLBACKS, true);
        }
    }

    /// Replace the entry with an empty one, returned to the caller
    pub fn recreate(self: &Arc<Self>) -> CacheResult<Arc<CacheEntry>> {
        if let Some(entry) = self.reopen_truncated(None) {
            return Ok(entry);
        }
        self.background_op(Ops::CALLBACKS, true);
        Err(CacheError::NotAvailable)
    }

    // ---- doom ----

    /// Remove the entry and its data
    ///
    /// Lookups miss the entry right away; `callback` runs on the callback
    /// thread once the file is gone. A second call fails with `InProgress`.
    pub fn async_doom(
        self: &Arc<Self>,
        callback: Option<Arc<dyn CacheEntryDoomCallback>>,
    ) -> CacheResult<()> {
        {
            let mut st = self.state.lock();
            if st.doom_callback.is_some() || st.doomed {
                return Err(CacheError::InProgress);
            }
            st.doomed = true;
            st.doom_callback = callback;
        }
        tracing::debug!("CacheEntry::async_doom {}", self.key());

        if let Some(service) = self.service.upgrade() {
            service.remove_entry(self);
        }
        self.background_op(Ops::DOOM, false);
        Ok(())
    }

    /// Doom an entry the service already dropped from its tables
    pub(crate) fn doom_already_removed(self: &Arc<Self>) {
        tracing::debug!("CacheEntry::doom_already_removed {}", self.key());
        self.state.lock().doomed = true;

        let Some(service) = self.service.upgrade() else {
            return;
        };
        if !service.is_on_management_thread() {
            self.background_op(Ops::DOOM, false);
            return;
        }

        service.unregister_entry(self);
        service.on_memory_consumption_change(self, 0);

        let (invoke_callbacks, file, callback) = {
            let mut st = self.state.lock();
            let invoke = !st.callbacks.is_empty() || !st.read_only_callbacks.is_empty();
            match st.file.clone() {
                Some(file) => (invoke, Some(file), None),
                // Nothing to wait for
                None => (invoke, None, st.doom_callback.take()),
            }
        };

        if invoke_callbacks {
            // May be reached from our own invoke_callbacks; never reenter it
            self.background_op(Ops::CALLBACKS, true);
        }

        if let Some(file) = file {
            let listener: Arc<dyn CacheFileListener> = self.clone();
            if let Err(e) = file.doom(Some(listener)) {
                self.on_file_doomed(Err(e));
            }
        } else if let Some(callback) = callback {
            self.notify_doomed(callback, Ok(()));
        }
    }

    fn notify_doomed(&self, callback: Arc<dyn CacheEntryDoomCallback>, result: CacheResult<()>) {
        let Some(service) = self.service.upgrade() else {
            return;
        };
        let dispatched =
            service.dispatch_callback(move || callback.on_cache_entry_doomed(result));
        if let Err(e) = dispatched {
            tracing::warn!("Cannot dispatch doom callback of {}: {}", self.key(), e);
        }
    }

    // ---- management thread ----

    /// Schedule `ops` on the management thread, or run them when already
    /// there
    pub(crate) fn background_op(self: &Arc<Self>, ops: u32, force_async: bool) {
        let Some(service) = self.service.upgrade() else {
            return;
        };

        if force_async || !service.is_on_management_thread() {
            let dispatch = self.state.lock().ops.set(ops);
            if dispatch {
                let this = self.clone();
                if let Err(e) = service.dispatch(move || this.run_background_ops()) {
                    tracing::debug!("Cannot dispatch ops of {}: {}", self.key(), e);
                }
            }
            return;
        }

        if ops & Ops::FRECENCYUPDATE != 0 {
            let frecency = update_frecency(self.frecency(), now_usecs());
            self.frecency.store(frecency.to_bits(), Ordering::Relaxed);
            tracing::trace!("Frecency of {} is now {:.10}", self.key(), frecency);
        }

        if ops & Ops::REGISTER != 0 {
            service.register_entry(self);
        }

        if ops & Ops::REPORTUSAGE != 0 {
            let size = self.file_memory.load(Ordering::Relaxed) as u64;
            service.on_memory_consumption_change(self, size);
        }

        if ops & Ops::DOOM != 0 {
            self.doom_already_removed();
        }

        if ops & Ops::CALLBACKS != 0 {
            self.invoke_callbacks();
        }
    }

    fn run_background_ops(self: &Arc<Self>) {
        let ops = self.state.lock().ops.grab();
        self.background_op(ops, false);
    }

    pub fn frecency(&self) -> f64 {
        f64::from_bits(self.frecency.load(Ordering::Relaxed))
    }

    /// Expiration time used to order the service's expiration array
    pub fn sorting_expiration_time(&self) -> u32 {
        self.sorting_expiration.load(Ordering::Relaxed)
    }

    pub(crate) fn reported_memory(&self) -> u64 {
        self.management.lock().reported_memory
    }

    pub(crate) fn set_reported_memory(&self, size: u64) -> u64 {
        std::mem::replace(&mut self.management.lock().reported_memory, size)
    }

    pub fn is_registered(&self) -> bool {
        self.management.lock().registered
    }

    pub(crate) fn can_register(&self) -> bool {
        let mgmt = self.management.lock();
        !mgmt.registered && !mgmt.registration_forbidden
    }

    /// Once unregistered an entry never registers again
    pub(crate) fn set_registered(&self, registered: bool) {
        let mut mgmt = self.management.lock();
        mgmt.registered = registered;
        if !registered {
            mgmt.registration_forbidden = true;
        }
    }

    /// Drop what `what` allows; returns `true` when the entry left the
    /// service's tables
    pub fn purge(self: &Arc<Self>, what: PurgeWhat) -> bool {
        tracing::debug!("CacheEntry::purge {} ({:?})", self.key(), what);

        if what != PurgeWhat::Whole && !self.use_disk() {
            return false;
        }

        {
            let st = self.state.lock();
            // Entries in use stay; zero frecency means never handed out yet
            if st.writing || st.loading || self.frecency() == 0.0 {
                return false;
            }
        }

        let Some(service) = self.service.upgrade() else {
            return false;
        };

        match what {
            PurgeWhat::WholeOnlyDiskBacked | PurgeWhat::Whole => {
                service.unregister_entry(self);
                service.remove_entry(self);
                service.on_memory_consumption_change(self, 0);
                true
            }
            PurgeWhat::DataOnlyDiskBacked => {
                let file = self.state.lock().file.clone();
                let size = match file {
                    Some(file) => {
                        if let Err(e) = file.throw_memory_cached_data() {
                            tracing::debug!("Cannot drop data of {}: {}", self.key(), e);
                        }
                        file.memory_size()
                    }
                    None => 0,
                };
                self.file_memory.store(size, Ordering::Relaxed);
                service.on_memory_consumption_change(self, size as u64);
                false
            }
        }
    }

    pub fn purge_and_doom(self: &Arc<Self>) {
        tracing::debug!("CacheEntry::purge_and_doom {}", self.key());
        if let Some(service) = self.service.upgrade() {
            service.remove_entry(self);
        }
        self.doom_already_removed();
    }

    // ---- consumer API ----

    /// Mark the entry usable and let the next consumers in
    pub fn set_valid(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            tracing::debug!("CacheEntry::set_valid {} (ready: {})", self.key(), st.ready);
            st.ready = true;
            st.writing = false;
            st.revalidating = false;
            st.writer = None;
        }

        self.background_op(Ops::REPORTUSAGE, false);
        self.invoke_callbacks();
    }

    /// The writer filled the metadata; readers may start streaming
    pub fn meta_data_ready(self: &Arc<Self>) {
        self.set_valid();
    }

    pub fn open_input_stream(&self, offset: u64) -> CacheResult<CacheFileInputStream> {
        let file = {
            let st = self.state.lock();
            if st.doomed {
                tracing::debug!("{} doomed, no input stream", self.key());
                return Err(CacheError::NotAvailable);
            }
            st.file.clone().ok_or(CacheError::NotAvailable)?
        };
        file.open_input_stream(offset)
    }

    pub fn open_output_stream(&self, offset: u64) -> CacheResult<CacheFileOutputStream> {
        let file = {
            let st = self.state.lock();
            if st.doomed {
                tracing::debug!("{} doomed, no output stream", self.key());
                return Err(CacheError::NotAvailable);
            }
            st.file.clone().ok_or(CacheError::NotAvailable)?
        };

        file.set_memory_only(!self.use_disk())?;
        file.open_output_stream(offset)
    }

    pub fn get_meta_data_element(&self, key: &str) -> CacheResult<String> {
        self.file()?.get_element(key).ok_or(CacheError::NotAvailable)
    }

    /// Set a metadata element; `None` removes it
    pub fn set_meta_data_element(&self, key: &str, value: Option<&str>) -> CacheResult<()> {
        self.file()?.set_element(key, value)
    }

    /// Every metadata element
    pub fn meta_data_elements(&self) -> CacheResult<Vec<(String, String)>> {
        Ok(self.file()?.elements())
    }

    pub fn security_info(&self) -> CacheResult<Option<String>> {
        let file = {
            let st = self.state.lock();
            if let Some(info) = &st.security_info {
                return Ok(info.clone());
            }
            st.file.clone().ok_or(CacheError::NotAvailable)?
        };

        let info = file.get_element(SECURITY_INFO_ELEMENT);
        self.state.lock().security_info = Some(info.clone());
        Ok(info)
    }

    pub fn set_security_info(&self, info: Option<&str>) -> CacheResult<()> {
        self.file()?
            .set_element(SECURITY_INFO_ELEMENT, info.filter(|s| !s.is_empty()))?;
        self.state.lock().security_info = Some(info.map(str::to_string));
        Ok(())
    }

    pub fn fetch_count(&self) -> CacheResult<u32> {
        Ok(self.file()?.fetch_count())
    }

    pub fn last_fetched(&self) -> CacheResult<u32> {
        Ok(self.file()?.last_fetched())
    }

    pub fn last_modified(&self) -> CacheResult<u32> {
        Ok(self.file()?.last_modified())
    }

    pub fn set_last_modified(&self, time: u32) -> CacheResult<()> {
        self.file()?.set_last_modified(time);
        Ok(())
    }

    pub fn expiration_time(&self) -> CacheResult<u32> {
        Ok(self.file()?.expiration_time())
    }

    /// Set the expiration time, also used to order expiration purges
    pub fn set_expiration_time(&self, time: u32) -> CacheResult<()> {
        self.file()?.set_expiration_time(time);
        self.sorting_expiration.store(time, Ordering::Relaxed);
        Ok(())
    }

    /// Length of the content; `InProgress` while a writer is active
    pub fn data_size(&self) -> CacheResult<u64> {
        let file = {
            let st = self.state.lock();
            if st.writing {
                return Err(CacheError::InProgress);
            }
            st.file.clone()
        };
        Ok(file.map(|f| f.data_size()).unwrap_or(0))
    }

    pub fn predicted_data_size(&self) -> i64 {
        self.predicted_data_size.load(Ordering::Relaxed)
    }

    pub fn set_predicted_data_size(&self, size: i64) {
        self.predicted_data_size.store(size, Ordering::Relaxed);
    }

    pub fn persist_to_disk(&self) -> bool {
        self.use_disk()
    }

    /// Change persistence; takes effect when the output stream opens
    pub fn set_persist_to_disk(self: &Arc<Self>, persist: bool) {
        if self.use_disk() == persist {
            return;
        }
        match self.service.upgrade() {
            Some(service) => service.set_entry_persistence(self, persist),
            None => self.use_disk.store(persist, Ordering::Relaxed),
        }
    }

    pub(crate) fn use_disk(&self) -> bool {
        self.use_disk.load(Ordering::Relaxed)
    }

    /// Called by the service, under its lock, when the entry is reopened
    /// for a different storage target
    pub(crate) fn set_use_disk(&self, use_disk: bool) -> bool {
        self.use_disk.swap(use_disk, Ordering::Relaxed) != use_disk
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().loaded
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    pub fn is_writing(&self) -> bool {
        self.state.lock().writing
    }

    pub fn is_doomed(&self) -> bool {
        self.state.lock().doomed
    }

    /// Memory last reported by the entry's file
    pub fn memory_size(&self) -> usize {
        self.file_memory.load(Ordering::Relaxed)
    }

    /// Snapshot for storage visitors
    pub fn info(&self) -> CacheEntryInfo {
        let (file, writing) = {
            let st = self.state.lock();
            (st.file.clone(), st.writing)
        };

        let mut info = CacheEntryInfo {
            uri: self.uri.as_str().to_string(),
            id_extension: self.id_extension.clone(),
            data_size: 0,
            fetch_count: 0,
            last_modified: 0,
            expiration_time: NO_EXPIRATION_TIME,
        };
        if let Some(file) = file {
            if !writing {
                info.data_size = file.data_size();
            }
            info.fetch_count = file.fetch_count();
            info.last_modified = file.last_modified();
            info.expiration_time = file.expiration_time();
        }
        info
    }
}

impl CacheFileListener for CacheEntry {
    fn on_file_ready(&self, result: CacheResult<()>, is_new: bool) {
        tracing::debug!(
            "CacheEntry::on_file_ready {} (ok: {}, new: {})",
            self.key(),
            result.is_ok(),
            is_new
        );

        {
            let mut st = self.state.lock();
            st.loaded = true;
            st.loading = false;
            st.ready = result.is_ok() && !is_new;
            if result.is_err() {
                st.file = None;
            }
        }

        let Some(this) = self.this() else {
            return;
        };
        if let Err(e) = result {
            tracing::warn!("Loading {} failed: {}", self.key(), e);
            let _ = this.async_doom(None);
        }
        this.invoke_callbacks();
    }

    fn on_file_doomed(&self, result: CacheResult<()>) {
        let callback = self.state.lock().doom_callback.take();
        if let Some(callback) = callback {
            self.notify_doomed(callback, result);
        }
    }

    fn on_memory_changed(&self, size: usize) {
        self.file_memory.store(size, Ordering::Relaxed);
        if let Some(this) = self.this() {
            this.background_op(Ops::REPORTUSAGE, false);
        }
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("storage_id", &self.storage_id)
            .field("uri", &self.uri.as_str())
            .field("id_extension", &self.id_extension)
            .finish()
    }
}

/// Writer access to an entry
///
/// Dropping or [`release`](Self::release)-ing the handle ends the write and
/// lets queued consumers in. Releasing twice is harmless.
pub struct CacheEntryHandle {
    entry: Arc<CacheEntry>,
    id: u64,
    released: AtomicBool,
}

impl CacheEntryHandle {
    fn new(entry: Arc<CacheEntry>, id: u64) -> Self {
        Self {
            entry,
            id,
            released: AtomicBool::new(false),
        }
    }

    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }

    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.entry.on_writer_closed(self.id);
        }
    }
}

impl std::ops::Deref for CacheEntryHandle {
    type Target = Arc<CacheEntry>;

    fn deref(&self) -> &Self::Target {
        &self.entry
    }
}

impl Drop for CacheEntryHandle {
    fn drop(&mut self) {
        self.release();
    }
}
