//! One 4 KiB unit of a cached file's content
//!
//! Chunks carry no lock of their own: they live in the owning
//! [`CacheFile`](super::CacheFile)'s chunk map and are only touched under
//! the file lock. Disk reads complete on the I/O thread and are applied to
//! the chunk through [`CacheFileChunk::on_read_complete`].

use crate::constants::{CHUNK_SIZE, MIN_CHUNK_BUF_SIZE};
use crate::error::{CacheError, CacheResult};
use crate::hash::hash16;

use super::validity::ValidityMap;

/// Lifecycle of a chunk buffer
#[derive(Debug, Clone)]
pub enum ChunkState {
    /// A disk read is in flight; writes go to a side buffer
    Reading,
    /// A single trusted buffer exists
    Ready,
    /// Reading failed; every waiter receives the error
    Error(CacheError),
}

#[derive(Debug)]
pub struct CacheFileChunk {
    index: u32,
    state: ChunkState,
    buf: Vec<u8>,
    buf_size: usize,
    /// Data written while the chunk was still being read from disk
    rw_buf: Vec<u8>,
    validity: ValidityMap,
    dirty: bool,
}

impl CacheFileChunk {
    /// Empty chunk at the end of the file, ready for a writer
    pub fn new_ready(index: u32) -> Self {
        Self {
            index,
            state: ChunkState::Ready,
            buf: Vec::new(),
            buf_size: 0,
            rw_buf: Vec::new(),
            validity: ValidityMap::new(),
            dirty: false,
        }
    }

    /// Chunk whose content is being read from disk
    pub fn new_reading(index: u32) -> Self {
        Self {
            state: ChunkState::Reading,
            ..Self::new_ready(index)
        }
    }

    /// Zero filled chunk of `len` bytes, written out on release
    pub fn new_zeroed(index: u32, len: usize) -> Self {
        let mut chunk = Self::new_ready(index);
        chunk.ensure_buf_size(len);
        chunk.buf.resize(len, 0);
        chunk.dirty = true;
        chunk
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn state(&self) -> &ChunkState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, ChunkState::Ready)
    }

    pub fn is_reading(&self) -> bool {
        matches!(self.state, ChunkState::Reading)
    }

    pub fn error(&self) -> Option<&CacheError> {
        match &self.state {
            ChunkState::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    /// Valid bytes of a ready chunk
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// Number of bytes readers may consume
    ///
    /// While reading from disk nothing is trusted yet.
    pub fn data_size(&self) -> usize {
        match self.state {
            ChunkState::Ready => self.buf.len(),
            _ => 0,
        }
    }

    /// Bytes allocated for the chunk buffers
    pub fn memory_size(&self) -> usize {
        self.buf_size + self.rw_buf.capacity()
    }

    pub fn hash(&self) -> u16 {
        hash16(&self.buf)
    }

    /// Grow the buffer allocation to the next power of two holding `size`
    fn ensure_buf_size(&mut self, size: usize) {
        if size <= self.buf_size {
            return;
        }

        let new_size = size
            .max(MIN_CHUNK_BUF_SIZE)
            .next_power_of_two()
            .min(CHUNK_SIZE);
        self.buf.reserve_exact(new_size - self.buf.len());
        self.buf_size = new_size;
    }

    /// Copy `data` into the chunk at `offset`
    ///
    /// Bytes between the current end and `offset` become zeros. On a chunk
    /// that is still being read the bytes are remembered in a side buffer
    /// and laid over the disk content once it arrives.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> CacheResult<()> {
        let end = offset + data.len();
        if end > CHUNK_SIZE {
            return Err(CacheError::InvalidArgument(format!(
                "write of {} bytes at {} exceeds chunk size",
                data.len(),
                offset
            )));
        }

        match &self.state {
            ChunkState::Ready => {
                self.ensure_buf_size(end);
                if self.buf.len() < end {
                    self.buf.resize(end, 0);
                }
                self.buf[offset..end].copy_from_slice(data);
            }
            ChunkState::Reading => {
                if self.rw_buf.len() < end {
                    self.rw_buf.resize(end, 0);
                }
                self.rw_buf[offset..end].copy_from_slice(data);
                self.validity.add_pair(offset as u32, data.len() as u32);
            }
            ChunkState::Error(e) => return Err(e.clone()),
        }

        self.dirty = true;
        Ok(())
    }

    /// Append zeros up to `len` bytes
    pub fn zero_extend(&mut self, len: usize) {
        if len > self.buf.len() && self.is_ready() {
            self.ensure_buf_size(len);
            self.buf.resize(len, 0);
            self.dirty = true;
        }
    }

    /// Apply the result of a disk read
    ///
    /// The content is checked against `expected_hash` first; writes that
    /// happened during the read win over the disk bytes they overlap.
    pub fn on_read_complete(
        &mut self,
        result: CacheResult<Vec<u8>>,
        expected_hash: Option<u16>,
    ) -> CacheResult<()> {
        let data = match result {
            Ok(data) => data,
            Err(e) => {
                self.state = ChunkState::Error(e.clone());
                return Err(e);
            }
        };

        if let Some(expected) = expected_hash {
            let actual = hash16(&data);
            if actual != expected {
                tracing::warn!(
                    "Hash mismatch in chunk {}: expected {:#06x}, got {:#06x}",
                    self.index,
                    expected,
                    actual
                );
                let e = CacheError::FileCorrupted { index: self.index };
                self.state = ChunkState::Error(e.clone());
                return Err(e);
            }
        }

        let size = data.len().max(self.validity.max_end() as usize);
        self.buf = data;
        self.buf_size = 0;
        self.ensure_buf_size(size);
        if self.buf.len() < size {
            self.buf.resize(size, 0);
        }

        for pair in self.validity.iter() {
            let range = pair.offset() as usize..pair.end() as usize;
            self.buf[range.clone()].copy_from_slice(&self.rw_buf[range]);
        }

        self.rw_buf = Vec::new();
        self.validity.clear();
        self.state = ChunkState::Ready;
        Ok(())
    }
}
