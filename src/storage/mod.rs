//! Storage service: entry tables per load context, purging and the
//! consumer facing storages

pub mod cache_storage;
pub mod context;
pub mod event_thread;
pub mod observer;
pub mod pool;
pub mod service;

pub use cache_storage::{CacheStorage, OpenFlags};
pub use context::{CacheUri, LoadContextInfo};
pub use event_thread::EventThread;
pub use observer::CacheObserver;
pub use pool::MemoryPool;
pub use service::CacheStorageService;
