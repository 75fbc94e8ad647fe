//! Cache entries and their consumer callbacks

pub mod cache_entry;
pub mod callback;
pub mod ops;

pub use cache_entry::{CacheEntry, CacheEntryHandle, OpenCallback, PurgeWhat};
pub use callback::{
    CacheEntryDoomCallback, CacheEntryInfo, CacheEntryOpenCallback, CacheStorageVisitor,
    CheckResult, EntryAccess,
};
pub use ops::{now_usecs, update_frecency, Ops};
