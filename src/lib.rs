//! cache2 - a disk and memory backed content cache engine
//!
//! Cached resources are split into 4KB chunks stored in one file per
//! resource, followed by a metadata block holding per-chunk hashes and
//! free-form key/value elements. It features:
//!
//! - **Chunked files**: chunks are read on demand, verified against their
//!   stored hash and kept in a small per-file LRU once released
//! - **Streaming**: readers may run ahead of the writer and wait for data
//! - **Single writer entries**: every entry is handed to at most one writer
//!   at a time; other consumers queue until it is done
//! - **Frecency eviction**: memory consumption above a configured ceiling
//!   purges expired entries first, then the least frecent ones
//!
//! # Architecture
//!
//! - **I/O Layer** ([`io`]): one thread executing every blocking file
//!   operation, ordered by priority level
//! - **File Layer** ([`file`]): chunks, metadata and streams of one file
//! - **Entry Layer** ([`entry`]): the consumer facing entry state machine
//! - **Storage Layer** ([`storage`]): entry tables per load context, the
//!   management thread and purging
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cache2::config::CacheConfig;
//! use cache2::entry::{CacheEntryOpenCallback, EntryAccess};
//! use cache2::error::CacheResult;
//! use cache2::storage::{CacheStorageService, LoadContextInfo, OpenFlags};
//!
//! struct Writer;
//!
//! impl CacheEntryOpenCallback for Writer {
//!     fn on_cache_entry_available(
//!         &self,
//!         entry: Option<EntryAccess>,
//!         _is_new: bool,
//!         status: CacheResult<()>,
//!     ) -> CacheResult<()> {
//!         status?;
//!         if let Some(EntryAccess::Writer(handle)) = entry {
//!             let output = handle.open_output_stream(0)?;
//!             output.write(b"hello")?;
//!             output.close();
//!             handle.meta_data_ready();
//!         }
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> CacheResult<()> {
//! let service = CacheStorageService::new(CacheConfig::with_cache_dir("/tmp/cache2"))?;
//! let storage = service.disk_cache_storage(&LoadContextInfo::default());
//! storage.async_open_uri("http://example.com/", "", OpenFlags::OPEN_NORMALLY, Arc::new(Writer))?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod entry;
pub mod error;
pub mod file;
pub mod hash;
pub mod io;
pub mod logging;
pub mod storage;

pub use config::CacheConfig;
pub use entry::{CacheEntry, CacheEntryHandle, CheckResult, EntryAccess};
pub use error::{CacheError, CacheResult};
pub use storage::{CacheStorage, CacheStorageService, LoadContextInfo, OpenFlags};
