use std::sync::Arc;

use thiserror::Error;

/// キャッシュエラー
///
/// One failure is often delivered to several listeners (every waiter of a
/// chunk, every queued callback of an entry), so the type is `Clone`.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// Requested data or handle does not exist (yet)
    #[error("Not available")]
    NotAvailable,

    /// On-disk content does not match the stored hash
    #[error("File corrupted (chunk {index})")]
    FileCorrupted { index: u32 },

    /// A conflicting operation is already outstanding
    #[error("Operation in progress")]
    InProgress,

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The entry is doomed or was never written
    #[error("Cache key not found")]
    KeyNotFound,

    /// Non-blocking stream operation must be retried after `async_wait`
    #[error("Operation would block")]
    WouldBlock,

    #[error("Stream closed")]
    StreamClosed,

    #[error("Cache service not initialized")]
    NotInitialized,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Io(Arc::new(e))
    }
}

impl CacheError {
    /// Whether the error only means "try again later" for a stream
    pub fn is_would_block(&self) -> bool {
        matches!(self, CacheError::WouldBlock)
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
