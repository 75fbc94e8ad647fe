//! Chunked cache files: content, metadata and streams

pub mod cache_file;
pub mod chunk;
pub mod chunk_cache;
pub mod input_stream;
pub mod metadata;
pub mod output_stream;
pub mod validity;

pub use cache_file::{CacheFile, CacheFileListener, FileInit, StreamReadyCallback};
pub use chunk::{CacheFileChunk, ChunkState};
pub use chunk_cache::{ChunkCache, ChunkCacheStats};
pub use input_stream::CacheFileInputStream;
pub use metadata::{CacheFileMetadata, NO_EXPIRATION_TIME};
pub use output_stream::CacheFileOutputStream;
pub use validity::{ValidityMap, ValidityPair};
