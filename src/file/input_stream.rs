//! Reader over a [`CacheFile`]

use std::io::SeekFrom;
use std::sync::Arc;

use super::cache_file::{CacheFile, StreamId, StreamReadyCallback};
use crate::error::{CacheError, CacheResult};

/// Non-blocking reader
///
/// `read` returns `WouldBlock` while the wanted bytes are still being read
/// from disk or not yet written by the file's writer; register a callback
/// with [`async_wait`](Self::async_wait) to learn when to retry. `Ok(0)`
/// means end of data.
pub struct CacheFileInputStream {
    file: Arc<CacheFile>,
    id: StreamId,
}

impl CacheFileInputStream {
    pub(crate) fn new(file: Arc<CacheFile>, id: StreamId) -> Self {
        Self { file, id }
    }

    pub fn read(&self, buf: &mut [u8]) -> CacheResult<usize> {
        self.file.input_read(self.id, buf)
    }

    /// Bytes known to be readable past the current position
    pub fn available(&self) -> CacheResult<u64> {
        self.file.input_available(self.id)
    }

    pub fn seek(&self, pos: SeekFrom) -> CacheResult<u64> {
        self.file.input_seek(self.id, pos)
    }

    pub fn tell(&self) -> CacheResult<u64> {
        self.file.input_tell(self.id)
    }

    /// Call `callback` once the stream can make progress
    ///
    /// `None` cancels a pending callback.
    pub fn async_wait(&self, callback: Option<StreamReadyCallback>) -> CacheResult<()> {
        self.file.input_async_wait(self.id, callback)
    }

    pub fn close(&self) {
        self.file.input_close(self.id, None);
    }

    /// Close with a failure every further read reports
    pub fn close_with_status(&self, status: CacheError) {
        self.file.input_close(self.id, Some(status));
    }

    pub fn file(&self) -> &Arc<CacheFile> {
        &self.file
    }
}

impl Drop for CacheFileInputStream {
    fn drop(&mut self) {
        self.file.remove_input(self.id);
    }
}

impl std::fmt::Debug for CacheFileInputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFileInputStream")
            .field("key", &self.file.key())
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::cache_file::{CacheFileListener, FileInit};
    use crate::io::CacheFileIoManager;
    use std::sync::Weak;

    struct Quiet;

    impl CacheFileListener for Quiet {
        fn on_file_ready(&self, _result: CacheResult<()>, _is_new: bool) {}
    }

    fn memory_file(data: &[u8]) -> (Arc<CacheFile>, Arc<Quiet>) {
        let io = CacheFileIoManager::init(None).unwrap();
        let file = CacheFile::new(io, "input-test", 4);
        let listener = Arc::new(Quiet);
        let weak = Arc::downgrade(&listener) as Weak<dyn CacheFileListener>;
        assert_eq!(file.init(true, true, false, weak).unwrap(), FileInit::Ready);
        let output = file.open_output_stream(0).unwrap();
        output.write(data).unwrap();
        output.close();
        (file, listener)
    }

    #[test]
    fn test_seek_and_available() {
        let (file, _l) = memory_file(b"0123456789");
        let input = file.open_input_stream(0).unwrap();
        assert_eq!(input.available().unwrap(), 10);

        assert_eq!(input.seek(SeekFrom::End(-3)).unwrap(), 7);
        let mut buf = [0u8; 8];
        assert_eq!(input.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"789");

        assert_eq!(input.seek(SeekFrom::Current(-5)).unwrap(), 5);
        assert_eq!(input.tell().unwrap(), 5);
        assert!(matches!(
            input.seek(SeekFrom::Current(-6)),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_closed_stream() {
        let (file, _l) = memory_file(b"abc");
        let input = file.open_input_stream(0).unwrap();
        input.close();
        let mut buf = [0u8; 4];
        assert_eq!(input.read(&mut buf).unwrap(), 0);
        assert!(matches!(input.available(), Err(CacheError::StreamClosed)));

        let failed = file.open_input_stream(0).unwrap();
        failed.close_with_status(CacheError::NotAvailable);
        assert!(matches!(failed.read(&mut buf), Err(CacheError::NotAvailable)));
    }

    #[test]
    fn test_async_wait_fires_when_not_waiting() {
        let (file, _l) = memory_file(b"abc");
        let input = file.open_input_stream(0).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        input
            .async_wait(Some(Box::new(move || tx.send(()).unwrap())))
            .unwrap();
        rx.try_recv().unwrap();
    }
}
