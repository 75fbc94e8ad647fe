//! Consumer facing callbacks of cache entries

use std::sync::Arc;

use super::cache_entry::{CacheEntry, CacheEntryHandle};
use crate::error::CacheResult;

/// Verdict of [`CacheEntryOpenCallback::on_cache_entry_check`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    /// Use the entry as it is
    Valid,
    /// Throw the entry away and start a fresh one
    NotValid,
    /// Hand the entry to this consumer as a writer; everyone else waits
    /// until it calls `set_valid` or releases the handle
    NeedsRevalidation,
}

/// What a consumer receives once the entry is available
pub enum EntryAccess {
    /// Shared read access to a ready entry
    Reader(Arc<CacheEntry>),
    /// Exclusive right to fill or revalidate the entry
    Writer(CacheEntryHandle),
}

impl EntryAccess {
    pub fn entry(&self) -> &Arc<CacheEntry> {
        match self {
            EntryAccess::Reader(entry) => entry,
            EntryAccess::Writer(handle) => handle.entry(),
        }
    }

    pub fn is_writer(&self) -> bool {
        matches!(self, EntryAccess::Writer(_))
    }

    pub fn into_writer(self) -> Option<CacheEntryHandle> {
        match self {
            EntryAccess::Writer(handle) => Some(handle),
            EntryAccess::Reader(_) => None,
        }
    }
}

impl std::fmt::Debug for EntryAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryAccess::Reader(entry) => f.debug_tuple("Reader").field(&entry.key()).finish(),
            EntryAccess::Writer(handle) => f
                .debug_tuple("Writer")
                .field(&handle.entry().key())
                .finish(),
        }
    }
}

/// Consumer of `async_open_uri`
///
/// `on_cache_entry_check` runs on whatever thread serves the callback queue;
/// `on_cache_entry_available` always runs on the service's callback thread.
pub trait CacheEntryOpenCallback: Send + Sync {
    /// Validate an existing entry before it is handed out
    ///
    /// Not called for read-only consumers. An error counts as `NotValid`.
    fn on_cache_entry_check(&self, _entry: &Arc<CacheEntry>) -> CacheResult<CheckResult> {
        Ok(CheckResult::Valid)
    }

    /// The open finished
    ///
    /// `entry` is `None` when `status` is an error (`KeyNotFound` for a
    /// doomed entry or a read-only open of a missing one). Returning an error
    /// while holding a writer handle releases it so the next consumer can
    /// proceed.
    fn on_cache_entry_available(
        &self,
        entry: Option<EntryAccess>,
        is_new: bool,
        status: CacheResult<()>,
    ) -> CacheResult<()>;
}

pub trait CacheEntryDoomCallback: Send + Sync {
    fn on_cache_entry_doomed(&self, result: CacheResult<()>);
}

/// Receives the contents of a storage from `async_visit_storage`
pub trait CacheStorageVisitor: Send + Sync {
    /// Totals of the storage, reported first
    fn on_cache_storage_info(&self, entry_count: usize, consumption: u64, capacity: u64);

    fn on_cache_entry_info(&self, _info: &CacheEntryInfo) {}

    /// Every entry was reported
    fn on_cache_entry_visit_completed(&self) {}
}

/// Snapshot of one entry handed to a [`CacheStorageVisitor`]
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CacheEntryInfo {
    pub uri: String,
    pub id_extension: String,
    pub data_size: u64,
    pub fetch_count: u32,
    pub last_modified: u32,
    pub expiration_time: u32,
}
