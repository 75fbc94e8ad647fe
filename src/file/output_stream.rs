//! The single writer of a [`CacheFile`]

use std::io::SeekFrom;
use std::sync::Arc;

use super::cache_file::{CacheFile, StreamId, StreamReadyCallback};
use crate::error::{CacheError, CacheResult};

/// Writer that overwrites in place and grows the data as needed
///
/// Writing past the end pads the gap with zeros. Closing wakes every reader
/// waiting for more data.
pub struct CacheFileOutputStream {
    file: Arc<CacheFile>,
    id: StreamId,
}

impl CacheFileOutputStream {
    pub(crate) fn new(file: Arc<CacheFile>, id: StreamId) -> Self {
        Self { file, id }
    }

    pub fn write(&self, data: &[u8]) -> CacheResult<usize> {
        self.file.output_write(self.id, data)
    }

    pub fn seek(&self, pos: SeekFrom) -> CacheResult<u64> {
        self.file.output_seek(self.id, pos)
    }

    pub fn tell(&self) -> CacheResult<u64> {
        self.file.output_tell(self.id)
    }

    pub fn async_wait(&self, callback: Option<StreamReadyCallback>) -> CacheResult<()> {
        self.file.output_async_wait(self.id, callback)
    }

    pub fn close(&self) {
        self.file.output_close(self.id, None);
    }

    pub fn close_with_status(&self, status: CacheError) {
        self.file.output_close(self.id, Some(status));
    }

    pub fn file(&self) -> &Arc<CacheFile> {
        &self.file
    }
}

impl Drop for CacheFileOutputStream {
    fn drop(&mut self) {
        self.file.output_close(self.id, None);
    }
}

impl std::fmt::Debug for CacheFileOutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFileOutputStream")
            .field("key", &self.file.key())
            .field("id", &self.id)
            .finish()
    }
}
