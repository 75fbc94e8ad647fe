//! Global constants for cache2
//!
//! This module centralizes the on-disk format constants and the fixed
//! tuning values shared by the I/O, file and storage layers.

/// Chunk size in bytes (4KB)
///
/// Every cached resource is split into chunks of this size. A chunk is the
/// unit of disk I/O, of hash verification and of in-memory residency.
pub const CHUNK_SIZE: usize = 4096;

/// Chunk size as a 64-bit value for offset arithmetic
pub const CHUNK_SIZE_U64: u64 = CHUNK_SIZE as u64;

/// Minimum allocation for a chunk buffer
///
/// Chunk buffers grow by powers of two from here up to [`CHUNK_SIZE`].
pub const MIN_CHUNK_BUF_SIZE: usize = 512;

/// Number of bytes read from the tail of a file when looking for metadata
pub const MIN_METADATA_READ: usize = 1024;

/// Size of the trailing offset field that closes the metadata block
pub const METADATA_OFFSET_SIZE: usize = 4;

/// Largest data size the metadata offset field can record
pub const MAX_DATA_SIZE: u64 = u32::MAX as u64;

/// Name of the directory holding live entry files
pub const ENTRIES_DIR: &str = "entries";

/// Name of the directory holding doomed entry files
pub const DOOMED_DIR: &str = "doomed";

/// Number of entries doomed per management thread quantum when clearing storage
pub const PURGE_BATCH_SIZE: usize = 50;

/// Half-life used by the frecency decay, in seconds (90 days)
pub const FRECENCY_HALF_LIFE_SECS: f64 = 90.0 * 24.0 * 60.0 * 60.0;

/// Name of the cache I/O thread
pub const IO_THREAD_NAME: &str = "cache2-io";

/// Name of the cache management thread
pub const MANAGEMENT_THREAD_NAME: &str = "cache2-management";

/// Name of the thread delivering consumer callbacks
pub const CALLBACK_THREAD_NAME: &str = "cache2-callbacks";

/// Metadata element holding the serialized security info
pub const SECURITY_INFO_ELEMENT: &str = "security-info";

/// Chunk index holding the given byte offset
#[inline]
pub fn chunk_index(offset: u64) -> u32 {
    (offset / CHUNK_SIZE_U64) as u32
}

/// Byte offset of the first byte of the given chunk
#[inline]
pub fn chunk_start(index: u32) -> u64 {
    index as u64 * CHUNK_SIZE_U64
}

/// Number of chunks needed to hold `data_size` bytes
#[inline]
pub fn chunk_count(data_size: u64) -> u32 {
    data_size.div_ceil(CHUNK_SIZE_U64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_arithmetic() {
        assert_eq!(chunk_index(0), 0);
        assert_eq!(chunk_index(4095), 0);
        assert_eq!(chunk_index(4096), 1);
        assert_eq!(chunk_start(3), 12288);
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(4096), 1);
        assert_eq!(chunk_count(4100), 2);
    }
}
