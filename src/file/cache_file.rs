//! One logical cached resource: metadata plus chunked content
//!
//! The file owns everything: the metadata, the active chunk map, the
//! released-chunk LRU, the chunk waiters and the state of every stream.
//! Streams are `(Arc<CacheFile>, id)` tokens and hold a chunk by index; the
//! chunk map counts those holders in [`ChunkSlot::consumers`]. When the count
//! drops to zero the file writes a dirty chunk out and then parks it in the
//! LRU. Completions from the I/O thread come back through
//! [`FileIoListener`] and are applied under the file lock.
//!
//! Stream callbacks and listener notifications always run after the file
//! lock is released.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::SeekFrom;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};

use super::chunk::CacheFileChunk;
use super::chunk_cache::ChunkCache;
use super::input_stream::CacheFileInputStream;
use super::metadata::{CacheFileMetadata, ParseOutcome};
use super::output_stream::CacheFileOutputStream;
use crate::constants::{
    chunk_count, chunk_index, chunk_start, CHUNK_SIZE, CHUNK_SIZE_U64, MAX_DATA_SIZE,
    MIN_METADATA_READ,
};
use crate::error::{CacheError, CacheResult};
use crate::hash::hash16;
use crate::io::{CacheFileHandle, CacheFileIoListener, CacheFileIoManager, OpenMode};

static ZERO_CHUNK: [u8; CHUNK_SIZE] = [0; CHUNK_SIZE];

pub type StreamId = u64;

/// Called once a stream may make progress again
pub type StreamReadyCallback = Box<dyn FnOnce() + Send + 'static>;

/// Owner side notifications of a [`CacheFile`]
pub trait CacheFileListener: Send + Sync {
    /// Initialization finished; `is_new` when no usable data was found
    fn on_file_ready(&self, result: CacheResult<()>, is_new: bool);

    fn on_file_doomed(&self, _result: CacheResult<()>) {}

    /// Memory held by the file changed
    fn on_memory_changed(&self, _size: usize) {}
}

/// Outcome of [`CacheFile::init`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileInit {
    /// Usable right away (memory-only or newly created); no listener call
    /// follows
    Ready,
    /// `on_file_ready` follows from the I/O thread
    Pending,
}

#[derive(Debug, Clone)]
pub(crate) enum StreamStatus {
    Open,
    Closed,
    Failed(CacheError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    Ready,
    Chunk(u32),
}

pub(crate) struct InputState {
    pos: u64,
    chunk: Option<u32>,
    waiting: Option<Wait>,
    status: StreamStatus,
    callback: Option<StreamReadyCallback>,
}

pub(crate) struct OutputState {
    id: StreamId,
    pos: u64,
    chunk: Option<u32>,
    callback: Option<StreamReadyCallback>,
}

struct ChunkSlot {
    chunk: CacheFileChunk,
    consumers: usize,
    /// A copy of the chunk is being written to disk
    writing: bool,
}

impl ChunkSlot {
    fn new(chunk: CacheFileChunk) -> Self {
        Self {
            chunk,
            consumers: 0,
            writing: false,
        }
    }
}

struct FileState {
    ready: bool,
    memory_only: bool,
    opening: bool,
    doomed: bool,
    data_accessed: bool,
    /// Fatal error; every stream operation fails with it
    status: CacheResult<()>,
    data_size: u64,
    metadata: CacheFileMetadata,
    handle: Option<Arc<CacheFileHandle>>,
    chunks: HashMap<u32, ChunkSlot>,
    cached_chunks: ChunkCache,
    /// Gap chunks that only exist as a zero hash in the metadata; the
    /// backing file may still end before them
    zero_chunks: HashSet<u32>,
    /// Input streams queued per chunk index, in registration order
    waiters: HashMap<u32, VecDeque<StreamId>>,
    ready_waiters: VecDeque<StreamId>,
    inputs: HashMap<StreamId, InputState>,
    output: Option<OutputState>,
    next_stream_id: StreamId,
    listener: Option<Weak<dyn CacheFileListener>>,
    /// Doom requested before the file was opened
    pending_doom: Option<Option<Arc<dyn CacheFileListener>>>,
    reported_memory: usize,
}

impl FileState {
    fn memory_size(&self) -> usize {
        self.metadata.memory_size()
            + self.cached_chunks.memory_bytes()
            + self
                .chunks
                .values()
                .map(|s| s.chunk.memory_size())
                .sum::<usize>()
    }

    fn has_open_streams(&self) -> bool {
        self.output.is_some()
            || self
                .inputs
                .values()
                .any(|i| matches!(i.status, StreamStatus::Open))
    }

    fn input(&mut self, id: StreamId) -> CacheResult<&mut InputState> {
        self.inputs.get_mut(&id).ok_or(CacheError::StreamClosed)
    }

    fn output(&mut self, id: StreamId) -> CacheResult<&mut OutputState> {
        match self.output.as_mut() {
            Some(out) if out.id == id => Ok(out),
            _ => Err(CacheError::StreamClosed),
        }
    }
}

pub struct CacheFile {
    key: String,
    io: Arc<CacheFileIoManager>,
    self_ref: Weak<CacheFile>,
    state: Mutex<FileState>,
}

impl CacheFile {
    /// Create an uninitialized file for `key`
    ///
    /// # Arguments
    /// * `io` - I/O manager performing the disk operations
    /// * `key` - Salted entry key, hashed into the file name
    /// * `cached_chunks_limit` - Capacity of the released-chunk LRU
    pub fn new(io: Arc<CacheFileIoManager>, key: &str, cached_chunks_limit: usize) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            key: key.to_string(),
            io,
            self_ref: self_ref.clone(),
            state: Mutex::new(FileState {
                ready: false,
                memory_only: false,
                opening: false,
                doomed: false,
                data_accessed: false,
                status: Ok(()),
                data_size: 0,
                metadata: CacheFileMetadata::new_empty(key),
                handle: None,
                chunks: HashMap::new(),
                cached_chunks: ChunkCache::new(cached_chunks_limit),
                zero_chunks: HashSet::new(),
                waiters: HashMap::new(),
                ready_waiters: VecDeque::new(),
                inputs: HashMap::new(),
                output: None,
                next_stream_id: 1,
                listener: None,
                pending_doom: None,
                reported_memory: 0,
            }),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Open the backing file or set up a memory-only file
    ///
    /// A memory-only or newly created file is ready on return; a failing
    /// create silently degrades to memory-only. Otherwise the listener's
    /// `on_file_ready` follows once the file is opened and its metadata read.
    pub fn init(
        &self,
        create_new: bool,
        memory_only: bool,
        priority: bool,
        listener: Weak<dyn CacheFileListener>,
    ) -> CacheResult<FileInit> {
        let mut st = self.state.lock();
        st.listener = Some(listener);

        if memory_only {
            st.memory_only = true;
            st.ready = true;
            tracing::debug!("CacheFile {} initialized memory-only", self.key);
            return Ok(FileInit::Ready);
        }

        // A new file has nothing to load; it is usable while the open runs
        st.opening = true;
        st.ready = create_new;
        let mode = if create_new {
            OpenMode::CreateNew
        } else {
            OpenMode::Create
        };
        let listener = self.io_listener(FileIoOp::Open { create_new });
        if let Err(e) = self.io.open_file(&self.key, mode, priority, listener) {
            st.opening = false;
            if !create_new {
                return Err(e);
            }
            tracing::warn!("Cannot open file for {} ({}), using memory only", self.key, e);
            st.memory_only = true;
            return Ok(FileInit::Ready);
        }

        if create_new {
            Ok(FileInit::Ready)
        } else {
            Ok(FileInit::Pending)
        }
    }

    fn io_listener(&self, op: FileIoOp) -> Arc<dyn CacheFileIoListener> {
        Arc::new(FileIoListener {
            file: self.self_ref.clone(),
            io: self.io.clone(),
            op,
        })
    }

    fn on_file_opened(&self, result: CacheResult<Arc<CacheFileHandle>>, create_new: bool) {
        let mut st = self.state.lock();
        st.opening = false;

        let handle = match result {
            Ok(handle) => handle,
            Err(e) if create_new => {
                tracing::warn!("Cannot create file for {} ({}), using memory only", self.key, e);
                st.memory_only = true;
                self.finish(st, Vec::new());
                return;
            }
            Err(e) => {
                if self.io.cache_dir().is_some() {
                    st.status = Err(e.clone());
                    self.file_ready_locked(st, Err(e), false);
                    return;
                }
                tracing::warn!("Cannot open file for {} ({}), using memory only", self.key, e);
                st.memory_only = true;
                self.file_ready_locked(st, Ok(()), true);
                return;
            }
        };

        st.handle = Some(handle.clone());
        if let Some(listener) = st.pending_doom.take() {
            st.doomed = true;
            let op = self.io_listener(FileIoOp::Doom(listener));
            if let Err(e) = self.io.doom_file(&handle, Some(op)) {
                tracing::warn!("Cannot doom {}: {}", self.key, e);
            }
        }

        if create_new {
            // Chunks released before the file existed are written out now
            let idle: Vec<u32> = st
                .chunks
                .iter()
                .filter(|(_, slot)| slot.consumers == 0)
                .map(|(index, _)| *index)
                .collect();
            for index in idle {
                self.maybe_remove_chunk_locked(&mut st, index);
            }
            self.maybe_write_metadata_locked(&mut st);
            self.finish(st, Vec::new());
            return;
        }

        let file_size = handle.file_size();
        if file_size == 0 {
            self.file_ready_locked(st, Ok(()), true);
            return;
        }

        let len = file_size.min(MIN_METADATA_READ as u64);
        let buf_offset = file_size - len;
        let op = self.io_listener(FileIoOp::ReadMetadata {
            buf_offset,
            first: true,
        });
        if let Err(e) = self.io.read(&handle, buf_offset, len as usize, op) {
            st.status = Err(e.clone());
            self.file_ready_locked(st, Err(e), false);
        }
    }

    fn on_metadata_read(&self, result: CacheResult<Vec<u8>>, buf_offset: u64, first: bool) {
        let mut st = self.state.lock();

        let outcome = match result {
            Ok(buf) => CacheFileMetadata::parse(&self.key, &buf, buf_offset),
            Err(e) => {
                tracing::warn!("Cannot read metadata of {}: {}", self.key, e);
                ParseOutcome::Invalid
            }
        };

        let is_new = match outcome {
            ParseOutcome::Parsed(metadata) => {
                st.data_size = metadata.offset();
                st.metadata = metadata;
                false
            }
            ParseOutcome::NeedMore { offset } if first => {
                if let Some(handle) = st.handle.clone() {
                    let len = (handle.file_size() - offset) as usize;
                    let op = self.io_listener(FileIoOp::ReadMetadata {
                        buf_offset: offset,
                        first: false,
                    });
                    if self.io.read(&handle, offset, len, op).is_ok() {
                        return;
                    }
                }
                tracing::warn!("Cannot read whole metadata of {}", self.key);
                st.metadata = CacheFileMetadata::new_empty(&self.key);
                true
            }
            _ => {
                tracing::debug!("No valid metadata for {}, treating as new", self.key);
                st.metadata = CacheFileMetadata::new_empty(&self.key);
                st.data_size = 0;
                true
            }
        };

        self.file_ready_locked(st, Ok(()), is_new);
    }

    /// Mark the file ready, wake streams and tell the owner
    fn file_ready_locked(
        &self,
        mut st: MutexGuard<'_, FileState>,
        result: CacheResult<()>,
        is_new: bool,
    ) {
        st.ready = result.is_ok();
        if result.is_ok() {
            tracing::debug!(
                "CacheFile {} ready (new: {}, size: {}, memory only: {})",
                self.key,
                is_new,
                st.data_size,
                st.memory_only
            );
        }

        let mut wake = Vec::new();
        while let Some(id) = st.ready_waiters.pop_front() {
            wake_input_locked(&mut st, id, &mut wake);
        }

        let listener = st.listener.as_ref().and_then(Weak::upgrade);
        self.finish(st, wake);
        if let Some(listener) = listener {
            listener.on_file_ready(result, is_new);
        }
    }

    /// Release the lock, run stream callbacks and report memory changes
    fn finish(&self, mut st: MutexGuard<'_, FileState>, wake: Vec<StreamReadyCallback>) {
        let size = st.memory_size();
        let listener = if size != st.reported_memory {
            st.reported_memory = size;
            st.listener.as_ref().and_then(Weak::upgrade)
        } else {
            None
        };
        drop(st);

        for callback in wake {
            callback();
        }
        if let Some(listener) = listener {
            listener.on_memory_changed(size);
        }
    }

    // ---- chunks ----

    /// Make chunk `index` resident for a reader or a writer
    ///
    /// Returns `true` when the caller may use the chunk now. A reader that
    /// has to wait is queued as a waiter of `index` and gets `false`.
    /// `NotAvailable` means the chunk does not exist and nobody will
    /// create it.
    fn get_chunk_locked(
        &self,
        st: &mut FileState,
        index: u32,
        writer: bool,
        waiter: Option<StreamId>,
        wake: &mut Vec<StreamReadyCallback>,
    ) -> CacheResult<bool> {
        if let Some(slot) = st.chunks.get(&index) {
            if let Some(e) = slot.chunk.error() {
                return Err(e.clone());
            }
            if slot.chunk.is_ready() || writer {
                return Ok(true);
            }
            queue_waiter_locked(st, index, waiter);
            return Ok(false);
        }

        if let Some(chunk) = st.cached_chunks.take(index) {
            tracing::trace!("Reviving cached chunk {} of {}", index, self.key);
            st.chunks.insert(index, ChunkSlot::new(chunk));
            return Ok(true);
        }

        if st.zero_chunks.remove(&index) {
            tracing::trace!("Materializing zero chunk {} of {}", index, self.key);
            st.chunks.insert(
                index,
                ChunkSlot::new(CacheFileChunk::new_zeroed(index, CHUNK_SIZE)),
            );
            return Ok(true);
        }

        let off = chunk_start(index);
        if off < st.data_size {
            self.read_chunk_locked(st, index)?;
            if writer {
                return Ok(true);
            }
            queue_waiter_locked(st, index, waiter);
            return Ok(false);
        }

        if writer {
            if off > st.data_size {
                self.pad_with_zeros_locked(st, index, wake)?;
            }
            st.chunks
                .insert(index, ChunkSlot::new(CacheFileChunk::new_ready(index)));
            notify_waiters_locked(st, index, wake);
            return Ok(true);
        }

        if st.output.is_some() {
            queue_waiter_locked(st, index, waiter);
            return Ok(false);
        }

        Err(CacheError::NotAvailable)
    }

    fn read_chunk_locked(&self, st: &mut FileState, index: u32) -> CacheResult<()> {
        let handle = st.handle.clone().ok_or(CacheError::NotAvailable)?;
        let off = chunk_start(index);
        let len = (st.data_size - off).min(CHUNK_SIZE_U64) as usize;
        let expected = st.metadata.get_hash(index);

        st.chunks
            .insert(index, ChunkSlot::new(CacheFileChunk::new_reading(index)));

        let op = self.io_listener(FileIoOp::ReadChunk { index, expected });
        if let Err(e) = self.io.read(&handle, off, len, op) {
            st.chunks.remove(&index);
            return Err(e);
        }
        tracing::trace!("Reading chunk {} of {} ({} bytes)", index, self.key, len);
        Ok(())
    }

    /// Fill everything between the current end of data and chunk `target`
    /// with zeros
    ///
    /// A partial last chunk is extended in memory. Whole chunks in between
    /// are only materialized when a reader waits on them (or for memory-only
    /// files); otherwise the metadata gets the zero-chunk hash and the file
    /// is cut at the old end so the hole reads back as zeros. Until a later
    /// write extends the file, such chunks are served from `zero_chunks`.
    fn pad_with_zeros_locked(
        &self,
        st: &mut FileState,
        target: u32,
        wake: &mut Vec<StreamReadyCallback>,
    ) -> CacheResult<()> {
        let old_size = st.data_size;
        let tail = (old_size % CHUNK_SIZE_U64) as usize;

        if tail != 0 {
            let index = chunk_index(old_size);
            if !st.chunks.contains_key(&index) {
                match st.cached_chunks.take(index) {
                    Some(chunk) => {
                        st.chunks.insert(index, ChunkSlot::new(chunk));
                    }
                    None => self.read_chunk_locked(st, index)?,
                }
            }

            if let Some(slot) = st.chunks.get_mut(&index) {
                if slot.chunk.is_ready() {
                    slot.chunk.zero_extend(CHUNK_SIZE);
                } else {
                    slot.chunk.write(tail, &ZERO_CHUNK[tail..])?;
                }
            }
            st.data_size = chunk_start(index + 1);
            notify_waiters_locked(st, index, wake);
            self.maybe_remove_chunk_locked(st, index);
        }

        let hole_start = st.data_size;
        let mut truncated = false;
        for index in chunk_index(st.data_size)..target {
            let has_waiters = st.waiters.get(&index).is_some_and(|w| !w.is_empty());
            if has_waiters || st.memory_only {
                st.chunks.insert(
                    index,
                    ChunkSlot::new(CacheFileChunk::new_zeroed(index, CHUNK_SIZE)),
                );
                st.data_size = chunk_start(index + 1);
                notify_waiters_locked(st, index, wake);
                self.maybe_remove_chunk_locked(st, index);
                continue;
            }

            st.metadata.set_hash(index, hash16(&ZERO_CHUNK));
            st.zero_chunks.insert(index);
            if !truncated {
                // Drop stale bytes past the old end; the hole reads back as zeros
                if let Some(handle) = st.handle.clone() {
                    self.io.truncate(&handle, hole_start)?;
                }
                truncated = true;
            }
            st.data_size = chunk_start(index + 1);
        }

        tracing::trace!(
            "Padded {} with zeros from {} to {}",
            self.key,
            old_size,
            st.data_size
        );
        Ok(())
    }

    fn on_chunk_read(&self, index: u32, result: CacheResult<Vec<u8>>, expected: Option<u16>) {
        let mut st = self.state.lock();
        let mut wake = Vec::new();

        if let Some(slot) = st.chunks.get_mut(&index) {
            if let Err(e) = slot.chunk.on_read_complete(result, expected) {
                tracing::warn!("Reading chunk {} of {} failed: {}", index, self.key, e);
                if matches!(e, CacheError::FileCorrupted { .. }) {
                    st.status = Err(e);
                }
            }
            notify_waiters_locked(&mut st, index, &mut wake);
            self.maybe_remove_chunk_locked(&mut st, index);
        }

        self.finish(st, wake);
    }

    /// Drop one consumer of chunk `index`
    fn unref_chunk_locked(&self, st: &mut FileState, index: u32) {
        if let Some(slot) = st.chunks.get_mut(&index) {
            slot.consumers = slot.consumers.saturating_sub(1);
        }
        self.maybe_remove_chunk_locked(st, index);
    }

    /// Retire a chunk nobody uses any more
    ///
    /// Dirty chunks of disk files are written first; the chunk stays in the
    /// map until the write completes. Memory-only chunks are never retired.
    fn maybe_remove_chunk_locked(&self, st: &mut FileState, index: u32) {
        let waited_on = st.waiters.get(&index).is_some_and(|w| !w.is_empty());
        let memory_only = st.memory_only;
        let handle = st.handle.clone();

        let Some(slot) = st.chunks.get_mut(&index) else {
            return;
        };
        if slot.consumers > 0 || slot.writing || slot.chunk.is_reading() || waited_on {
            return;
        }

        if slot.chunk.error().is_some() {
            st.chunks.remove(&index);
            return;
        }
        if memory_only {
            return;
        }

        if slot.chunk.is_dirty() {
            let Some(handle) = handle else {
                return;
            };

            let data = Bytes::copy_from_slice(slot.chunk.data());
            let hash = slot.chunk.hash();
            slot.writing = true;
            slot.chunk.set_dirty(false);

            let op = self.io_listener(FileIoOp::WriteChunk { index, hash });
            if let Err(e) = self
                .io
                .write(&handle, chunk_start(index), data, false, Some(op))
            {
                tracing::warn!("Cannot write chunk {} of {}: {}", index, self.key, e);
                if let Some(slot) = st.chunks.get_mut(&index) {
                    slot.writing = false;
                    slot.chunk.set_dirty(true);
                }
            }
            return;
        }

        if let Some(slot) = st.chunks.remove(&index) {
            st.cached_chunks.put(slot.chunk);
        }
        self.maybe_write_metadata_locked(st);
    }

    fn on_chunk_written(&self, index: u32, hash: u16, result: CacheResult<()>) {
        let mut st = self.state.lock();

        let Some(slot) = st.chunks.get_mut(&index) else {
            self.finish(st, Vec::new());
            return;
        };
        slot.writing = false;

        match result {
            Ok(()) => {
                st.metadata.set_hash(index, hash);
                self.maybe_remove_chunk_locked(&mut st, index);
            }
            Err(e) => {
                // Kept dirty and resident; the next release retries.
                tracing::warn!("Writing chunk {} of {} failed: {}", index, self.key, e);
                slot.chunk.set_dirty(true);
            }
        }

        self.finish(st, Vec::new());
    }

    // ---- metadata ----

    /// Write the metadata block if it changed and nothing uses the file
    fn maybe_write_metadata_locked(&self, st: &mut FileState) {
        if st.memory_only || !st.ready || !st.chunks.is_empty() || st.has_open_streams() {
            return;
        }
        if !st.metadata.is_dirty() && st.metadata.offset() == st.data_size {
            return;
        }
        let Some(handle) = st.handle.clone() else {
            return;
        };

        let data_size = st.data_size;
        st.metadata.truncate_hashes(chunk_count(data_size));
        let block = match st.metadata.serialize(data_size) {
            Ok(block) => Bytes::from(block),
            Err(e) => {
                tracing::warn!("Cannot serialize metadata of {}: {}", self.key, e);
                return;
            }
        };
        st.metadata.set_dirty(false);
        st.metadata.set_offset(data_size);

        let op = self.io_listener(FileIoOp::WriteMetadata);
        if let Err(e) = self.io.write(&handle, data_size, block, true, Some(op)) {
            tracing::warn!("Cannot write metadata of {}: {}", self.key, e);
            st.metadata.set_dirty(true);
        } else {
            tracing::trace!("Writing metadata of {} at {}", self.key, data_size);
        }
    }

    fn on_metadata_written(&self, result: CacheResult<()>) {
        if let Err(e) = result {
            tracing::warn!("Writing metadata of {} failed: {}", self.key, e);
            self.state.lock().metadata.set_dirty(true);
        }
    }

    /// Write the metadata now if it is dirty and the file is idle
    pub fn write_metadata_if_needed(&self) {
        let mut st = self.state.lock();
        self.maybe_write_metadata_locked(&mut st);
    }

    pub fn get_element(&self, key: &str) -> Option<String> {
        self.state.lock().metadata.get_element(key).map(str::to_string)
    }

    /// Set (or with `None` remove) a metadata element
    pub fn set_element(&self, key: &str, value: Option<&str>) -> CacheResult<()> {
        let mut st = self.state.lock();
        let result = st.metadata.set_element(key, value);
        self.finish(st, Vec::new());
        result
    }

    pub fn elements(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .metadata
            .elements()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    pub fn expiration_time(&self) -> u32 {
        self.state.lock().metadata.expiration_time()
    }

    pub fn set_expiration_time(&self, time: u32) {
        self.state.lock().metadata.set_expiration_time(time);
    }

    pub fn last_modified(&self) -> u32 {
        self.state.lock().metadata.last_modified()
    }

    pub fn set_last_modified(&self, time: u32) {
        self.state.lock().metadata.set_last_modified(time);
    }

    pub fn last_fetched(&self) -> u32 {
        self.state.lock().metadata.last_fetched()
    }

    pub fn fetch_count(&self) -> u32 {
        self.state.lock().metadata.fetch_count()
    }

    /// Bump the fetch count and last-fetched time
    pub fn on_fetched(&self) {
        self.state.lock().metadata.on_fetched();
    }

    // ---- file state ----

    pub fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    pub fn data_size(&self) -> u64 {
        self.state.lock().data_size
    }

    pub fn has_output(&self) -> bool {
        self.state.lock().output.is_some()
    }

    pub fn is_memory_only(&self) -> bool {
        self.state.lock().memory_only
    }

    /// Switch persistence before any data was accessed
    pub fn set_memory_only(&self, memory_only: bool) -> CacheResult<()> {
        let mut st = self.state.lock();
        if st.memory_only == memory_only {
            return Ok(());
        }
        if !st.ready || st.data_accessed {
            return Err(CacheError::Unexpected(
                "memory-only can only change before data is accessed".to_string(),
            ));
        }
        st.memory_only = memory_only;
        Ok(())
    }

    /// Whether the backing file was doomed
    pub fn is_doomed(&self) -> bool {
        let st = self.state.lock();
        st.doomed || st.handle.as_ref().is_some_and(|h| h.is_doomed())
    }

    /// Heap bytes held by chunks and metadata
    pub fn memory_size(&self) -> usize {
        self.state.lock().memory_size()
    }

    /// Drop cached chunk data that can be read back from disk
    ///
    /// Refused for memory-only files, whose memory is the only copy.
    pub fn throw_memory_cached_data(&self) -> CacheResult<()> {
        let mut st = self.state.lock();
        if st.memory_only {
            return Err(CacheError::NotAvailable);
        }
        let dropped = st.cached_chunks.len();
        st.cached_chunks.clear();
        tracing::trace!("Dropped {} cached chunks of {}", dropped, self.key);
        self.finish(st, Vec::new());
        Ok(())
    }

    /// Doom the backing file
    ///
    /// Memory-only files have nothing to doom and report success at once.
    pub fn doom(&self, listener: Option<Arc<dyn CacheFileListener>>) -> CacheResult<()> {
        let mut st = self.state.lock();

        if st.memory_only {
            st.doomed = true;
            drop(st);
            if let Some(listener) = listener {
                listener.on_file_doomed(Ok(()));
            }
            return Ok(());
        }

        let Some(handle) = st.handle.clone() else {
            if st.opening {
                st.pending_doom = Some(listener);
                return Ok(());
            }
            return Err(CacheError::NotAvailable);
        };

        st.doomed = true;
        drop(st);
        tracing::debug!("Dooming file of {}", self.key);
        self.io
            .doom_file(&handle, Some(self.io_listener(FileIoOp::Doom(listener))))
    }

    // ---- streams ----

    /// Open a reader positioned at `offset`
    ///
    /// Allowed before the file is ready; reads block until it is.
    pub fn open_input_stream(&self, offset: u64) -> CacheResult<CacheFileInputStream> {
        let file = self.self_ref.upgrade().ok_or(CacheError::NotInitialized)?;
        let mut st = self.state.lock();
        if let Err(e) = &st.status {
            return Err(e.clone());
        }

        let id = st.next_stream_id;
        st.next_stream_id += 1;
        st.data_accessed = true;
        st.inputs.insert(
            id,
            InputState {
                pos: offset,
                chunk: None,
                waiting: None,
                status: StreamStatus::Open,
                callback: None,
            },
        );
        tracing::trace!("Opened input stream {} on {} at {}", id, self.key, offset);
        Ok(CacheFileInputStream::new(file, id))
    }

    /// Open the single writer positioned at `offset`
    pub fn open_output_stream(&self, offset: u64) -> CacheResult<CacheFileOutputStream> {
        let file = self.self_ref.upgrade().ok_or(CacheError::NotInitialized)?;
        let mut st = self.state.lock();
        if !st.ready || st.output.is_some() {
            return Err(CacheError::NotAvailable);
        }
        if let Err(e) = &st.status {
            return Err(e.clone());
        }

        let id = st.next_stream_id;
        st.next_stream_id += 1;
        st.data_accessed = true;
        st.output = Some(OutputState {
            id,
            pos: offset,
            chunk: None,
            callback: None,
        });
        tracing::trace!("Opened output stream {} on {} at {}", id, self.key, offset);
        Ok(CacheFileOutputStream::new(file, id))
    }

    pub(crate) fn input_read(&self, id: StreamId, buf: &mut [u8]) -> CacheResult<usize> {
        let mut st = self.state.lock();
        let mut wake = Vec::new();
        let result = self.input_read_locked(&mut st, id, buf, &mut wake);
        self.finish(st, wake);
        result
    }

    fn input_read_locked(
        &self,
        st: &mut FileState,
        id: StreamId,
        buf: &mut [u8],
        wake: &mut Vec<StreamReadyCallback>,
    ) -> CacheResult<usize> {
        let input = st.input(id)?;
        match &input.status {
            StreamStatus::Open => {}
            StreamStatus::Closed => return Ok(0),
            StreamStatus::Failed(e) => return Err(e.clone()),
        }
        let (pos, held) = (input.pos, input.chunk);

        if buf.is_empty() {
            return Ok(0);
        }
        if !st.ready {
            if let Err(e) = st.status.clone() {
                return Err(e);
            }
            if !st.ready_waiters.contains(&id) {
                st.ready_waiters.push_back(id);
            }
            st.input(id)?.waiting = Some(Wait::Ready);
            return Err(CacheError::WouldBlock);
        }

        let index = chunk_index(pos);
        if held != Some(index) {
            if let Some(old) = held {
                st.input(id)?.chunk = None;
                self.unref_chunk_locked(st, old);
            }

            match self.get_chunk_locked(st, index, false, Some(id), wake) {
                Ok(_) => {}
                Err(CacheError::NotAvailable) => {
                    self.close_input_locked(st, id, None, wake);
                    return Ok(0);
                }
                Err(e) => {
                    self.close_input_locked(st, id, Some(e.clone()), wake);
                    return Err(e);
                }
            }

            match st.chunks.get_mut(&index) {
                Some(slot) => slot.consumers += 1,
                None => {
                    st.input(id)?.waiting = Some(Wait::Chunk(index));
                    return Err(CacheError::WouldBlock);
                }
            }
            st.input(id)?.chunk = Some(index);
        }

        let slot = st
            .chunks
            .get(&index)
            .ok_or_else(|| CacheError::Unexpected(format!("held chunk {} missing", index)))?;

        if let Some(e) = slot.chunk.error().cloned() {
            self.close_input_locked(st, id, Some(e.clone()), wake);
            return Err(e);
        }
        if slot.chunk.is_reading() {
            queue_waiter_locked(st, index, Some(id));
            st.input(id)?.waiting = Some(Wait::Chunk(index));
            return Err(CacheError::WouldBlock);
        }

        let chunk_off = (pos - chunk_start(index)) as usize;
        let available = slot.chunk.data_size().saturating_sub(chunk_off);
        if available == 0 {
            if st.output.is_some() {
                queue_waiter_locked(st, index, Some(id));
                st.input(id)?.waiting = Some(Wait::Chunk(index));
                return Err(CacheError::WouldBlock);
            }
            self.close_input_locked(st, id, None, wake);
            return Ok(0);
        }

        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&slot.chunk.data()[chunk_off..chunk_off + n]);
        st.input(id)?.pos += n as u64;
        Ok(n)
    }

    /// Bytes left before the currently known end of data
    pub(crate) fn input_available(&self, id: StreamId) -> CacheResult<u64> {
        let mut st = self.state.lock();
        let data_size = st.data_size;
        let input = st.input(id)?;
        match &input.status {
            StreamStatus::Open => Ok(data_size.saturating_sub(input.pos)),
            StreamStatus::Closed => Err(CacheError::StreamClosed),
            StreamStatus::Failed(e) => Err(e.clone()),
        }
    }

    pub(crate) fn input_seek(&self, id: StreamId, pos: SeekFrom) -> CacheResult<u64> {
        let mut st = self.state.lock();
        let data_size = st.data_size;
        let input = st.input(id)?;
        if !matches!(input.status, StreamStatus::Open) {
            return Err(CacheError::StreamClosed);
        }

        let new_pos = resolve_seek(pos, input.pos, data_size)?;
        input.pos = new_pos;
        let held = input.chunk;
        if held.is_some_and(|index| index != chunk_index(new_pos)) {
            input.chunk = None;
            if let Some(old) = held {
                self.unref_chunk_locked(&mut st, old);
            }
        }
        cancel_wait_locked(&mut st, id);
        self.finish(st, Vec::new());
        Ok(new_pos)
    }

    pub(crate) fn input_tell(&self, id: StreamId) -> CacheResult<u64> {
        Ok(self.state.lock().input(id)?.pos)
    }

    /// Register (or with `None` cancel) the readiness callback
    ///
    /// The callback fires right away when the stream is not waiting for
    /// anything.
    pub(crate) fn input_async_wait(
        &self,
        id: StreamId,
        callback: Option<StreamReadyCallback>,
    ) -> CacheResult<()> {
        let mut st = self.state.lock();
        let input = st.input(id)?;

        let Some(callback) = callback else {
            input.callback = None;
            return Ok(());
        };

        let fire_now = !matches!(input.status, StreamStatus::Open) || input.waiting.is_none();
        if fire_now {
            drop(st);
            callback();
        } else {
            input.callback = Some(callback);
        }
        Ok(())
    }

    pub(crate) fn input_close(&self, id: StreamId, status: Option<CacheError>) {
        let mut st = self.state.lock();
        let mut wake = Vec::new();
        self.close_input_locked(&mut st, id, status, &mut wake);
        self.finish(st, wake);
    }

    /// Close and forget the stream
    pub(crate) fn remove_input(&self, id: StreamId) {
        let mut st = self.state.lock();
        let mut wake = Vec::new();
        self.close_input_locked(&mut st, id, None, &mut wake);
        st.inputs.remove(&id);
        self.finish(st, wake);
    }

    fn close_input_locked(
        &self,
        st: &mut FileState,
        id: StreamId,
        status: Option<CacheError>,
        wake: &mut Vec<StreamReadyCallback>,
    ) {
        let Some(input) = st.inputs.get_mut(&id) else {
            return;
        };
        if !matches!(input.status, StreamStatus::Open) {
            return;
        }

        input.status = match status {
            Some(e) => StreamStatus::Failed(e),
            None => StreamStatus::Closed,
        };
        let held = input.chunk.take();
        if let Some(callback) = input.callback.take() {
            wake.push(callback);
        }

        cancel_wait_locked(st, id);
        if let Some(index) = held {
            self.unref_chunk_locked(st, index);
        }
        tracing::trace!("Closed input stream {} on {}", id, self.key);
        self.maybe_write_metadata_locked(st);
    }

    pub(crate) fn output_write(&self, id: StreamId, data: &[u8]) -> CacheResult<usize> {
        let mut st = self.state.lock();
        let mut wake = Vec::new();
        let result = self.output_write_locked(&mut st, id, data, &mut wake);
        self.finish(st, wake);
        result
    }

    fn output_write_locked(
        &self,
        st: &mut FileState,
        id: StreamId,
        data: &[u8],
        wake: &mut Vec<StreamReadyCallback>,
    ) -> CacheResult<usize> {
        let start = st.output(id)?.pos;
        if let Err(e) = &st.status {
            return Err(e.clone());
        }
        if start.saturating_add(data.len() as u64) > MAX_DATA_SIZE {
            return Err(CacheError::InvalidArgument(format!(
                "write of {} bytes at {} exceeds the largest entry",
                data.len(),
                start
            )));
        }

        let mut written = 0;
        while written < data.len() {
            let out = st.output(id)?;
            let pos = out.pos;
            let held = out.chunk;
            let index = chunk_index(pos);

            if held != Some(index) {
                if let Some(old) = held {
                    st.output(id)?.chunk = None;
                    self.unref_chunk_locked(st, old);
                }
                self.get_chunk_locked(st, index, true, None, wake)?;
                let slot = st
                    .chunks
                    .get_mut(&index)
                    .ok_or_else(|| CacheError::Unexpected(format!("chunk {} missing", index)))?;
                slot.consumers += 1;
                st.output(id)?.chunk = Some(index);
            }

            let chunk_off = (pos - chunk_start(index)) as usize;
            let n = (CHUNK_SIZE - chunk_off).min(data.len() - written);
            let slot = st
                .chunks
                .get_mut(&index)
                .ok_or_else(|| CacheError::Unexpected(format!("chunk {} missing", index)))?;
            slot.chunk.write(chunk_off, &data[written..written + n])?;

            written += n;
            let new_pos = pos + n as u64;
            st.output(id)?.pos = new_pos;
            if new_pos > st.data_size {
                st.data_size = new_pos;
            }
            notify_waiters_locked(st, index, wake);
        }

        Ok(written)
    }

    pub(crate) fn output_seek(&self, id: StreamId, pos: SeekFrom) -> CacheResult<u64> {
        let mut st = self.state.lock();
        let data_size = st.data_size;
        let out = st.output(id)?;
        let new_pos = resolve_seek(pos, out.pos, data_size)?;
        out.pos = new_pos;
        let held = out.chunk;
        if held.is_some_and(|index| index != chunk_index(new_pos)) {
            out.chunk = None;
            if let Some(old) = held {
                self.unref_chunk_locked(&mut st, old);
            }
        }
        self.finish(st, Vec::new());
        Ok(new_pos)
    }

    pub(crate) fn output_tell(&self, id: StreamId) -> CacheResult<u64> {
        Ok(self.state.lock().output(id)?.pos)
    }

    /// Writes never block, so the callback fires at once on an open stream
    pub(crate) fn output_async_wait(
        &self,
        id: StreamId,
        callback: Option<StreamReadyCallback>,
    ) -> CacheResult<()> {
        let mut st = self.state.lock();
        let out = st.output(id)?;
        out.callback = None;
        drop(st);
        if let Some(callback) = callback {
            callback();
        }
        Ok(())
    }

    /// Close the writer; waiting readers wake up to see the final data
    pub(crate) fn output_close(&self, id: StreamId, status: Option<CacheError>) {
        let mut st = self.state.lock();
        let Ok(out) = st.output(id) else {
            return;
        };
        let held = out.chunk.take();
        let callback = out.callback.take();
        st.output = None;

        if let Some(e) = &status {
            tracing::warn!("Output stream of {} closed with error: {}", self.key, e);
        }

        let mut wake: Vec<StreamReadyCallback> = callback.into_iter().collect();
        if let Some(index) = held {
            self.unref_chunk_locked(&mut st, index);
        }

        let indexes: Vec<u32> = st.waiters.keys().copied().collect();
        for index in indexes {
            notify_waiters_locked(&mut st, index, &mut wake);
            self.maybe_remove_chunk_locked(&mut st, index);
        }

        tracing::trace!("Closed output stream {} on {}", id, self.key);
        self.maybe_write_metadata_locked(&mut st);
        self.finish(st, wake);
    }
}

impl Drop for CacheFile {
    /// Flush what is still only in memory and give the handle back
    fn drop(&mut self) {
        let st = self.state.get_mut();
        let Some(handle) = st.handle.take() else {
            return;
        };

        if st.ready && !st.memory_only && !st.doomed {
            let mut indexes: Vec<u32> = st.chunks.keys().copied().collect();
            indexes.sort_unstable();
            for index in indexes {
                let Some(slot) = st.chunks.get_mut(&index) else {
                    continue;
                };
                if !slot.chunk.is_ready() {
                    continue;
                }
                st.metadata.set_hash(index, slot.chunk.hash());
                if slot.chunk.is_dirty() || slot.writing {
                    let data = Bytes::copy_from_slice(slot.chunk.data());
                    if let Err(e) = self.io.write(&handle, chunk_start(index), data, false, None) {
                        tracing::warn!("Cannot flush chunk {} of {}: {}", index, self.key, e);
                    }
                }
            }

            if st.metadata.is_dirty() || st.metadata.offset() != st.data_size {
                st.metadata.truncate_hashes(chunk_count(st.data_size));
                let written = st.metadata.serialize(st.data_size).and_then(|block| {
                    self.io
                        .write(&handle, st.data_size, Bytes::from(block), true, None)
                });
                if let Err(e) = written {
                    tracing::warn!("Cannot flush metadata of {}: {}", self.key, e);
                }
            }
        }

        self.io.release_handle(handle);
    }
}

fn resolve_seek(pos: SeekFrom, current: u64, data_size: u64) -> CacheResult<u64> {
    let new_pos = match pos {
        SeekFrom::Start(n) => Some(n),
        SeekFrom::Current(delta) => current.checked_add_signed(delta),
        SeekFrom::End(delta) => data_size.checked_add_signed(delta),
    };
    new_pos.ok_or_else(|| CacheError::InvalidArgument(format!("bad seek {:?}", pos)))
}

fn queue_waiter_locked(st: &mut FileState, index: u32, waiter: Option<StreamId>) {
    let Some(id) = waiter else {
        return;
    };
    let queue = st.waiters.entry(index).or_default();
    if !queue.contains(&id) {
        queue.push_back(id);
    }
    if let Some(input) = st.inputs.get_mut(&id) {
        input.waiting = Some(Wait::Chunk(index));
    }
}

fn notify_waiters_locked(st: &mut FileState, index: u32, wake: &mut Vec<StreamReadyCallback>) {
    if let Some(ids) = st.waiters.remove(&index) {
        for id in ids {
            wake_input_locked(st, id, wake);
        }
    }
}

fn wake_input_locked(st: &mut FileState, id: StreamId, wake: &mut Vec<StreamReadyCallback>) {
    if let Some(input) = st.inputs.get_mut(&id) {
        input.waiting = None;
        if let Some(callback) = input.callback.take() {
            wake.push(callback);
        }
    }
}

fn cancel_wait_locked(st: &mut FileState, id: StreamId) {
    let Some(input) = st.inputs.get_mut(&id) else {
        return;
    };
    match input.waiting.take() {
        Some(Wait::Chunk(index)) => {
            if let Some(queue) = st.waiters.get_mut(&index) {
                queue.retain(|w| *w != id);
                if queue.is_empty() {
                    st.waiters.remove(&index);
                }
            }
        }
        Some(Wait::Ready) => st.ready_waiters.retain(|w| *w != id),
        None => {}
    }
}

enum FileIoOp {
    Open { create_new: bool },
    ReadMetadata { buf_offset: u64, first: bool },
    ReadChunk { index: u32, expected: Option<u16> },
    WriteChunk { index: u32, hash: u16 },
    WriteMetadata,
    Doom(Option<Arc<dyn CacheFileListener>>),
}

/// Routes I/O completions back to the file that issued them
struct FileIoListener {
    file: Weak<CacheFile>,
    io: Arc<CacheFileIoManager>,
    op: FileIoOp,
}

impl CacheFileIoListener for FileIoListener {
    fn on_file_opened(&self, result: CacheResult<Arc<CacheFileHandle>>) {
        let FileIoOp::Open { create_new } = self.op else {
            return;
        };
        match self.file.upgrade() {
            Some(file) => file.on_file_opened(result, create_new),
            None => {
                if let Ok(handle) = result {
                    self.io.release_handle(handle);
                }
            }
        }
    }

    fn on_data_read(&self, _handle: &Arc<CacheFileHandle>, result: CacheResult<Vec<u8>>) {
        let Some(file) = self.file.upgrade() else {
            return;
        };
        match self.op {
            FileIoOp::ReadMetadata { buf_offset, first } => {
                file.on_metadata_read(result, buf_offset, first)
            }
            FileIoOp::ReadChunk { index, expected } => file.on_chunk_read(index, result, expected),
            _ => {}
        }
    }

    fn on_data_written(&self, _handle: &Arc<CacheFileHandle>, result: CacheResult<()>) {
        let Some(file) = self.file.upgrade() else {
            return;
        };
        match self.op {
            FileIoOp::WriteChunk { index, hash } => file.on_chunk_written(index, hash, result),
            FileIoOp::WriteMetadata => file.on_metadata_written(result),
            _ => {}
        }
    }

    fn on_file_doomed(&self, result: CacheResult<()>) {
        if let FileIoOp::Doom(Some(listener)) = &self.op {
            listener.on_file_doomed(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ENTRIES_DIR;
    use crate::hash::CacheHash;
    use crate::io::IoLevel;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct TestListener(Mutex<mpsc::Sender<(CacheResult<()>, bool)>>);

    impl CacheFileListener for TestListener {
        fn on_file_ready(&self, result: CacheResult<()>, is_new: bool) {
            let _ = self.0.lock().send((result, is_new));
        }
    }

    struct Env {
        dir: TempDir,
        io: Arc<CacheFileIoManager>,
    }

    impl Env {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let io = CacheFileIoManager::init(Some(dir.path().to_path_buf())).unwrap();
            Self { dir, io }
        }

        /// Open `key` and wait until it is ready
        fn open(&self, key: &str, create_new: bool) -> (Arc<CacheFile>, Arc<TestListener>, bool) {
            let (tx, rx) = mpsc::channel();
            let listener = Arc::new(TestListener(Mutex::new(tx)));
            let file = CacheFile::new(self.io.clone(), key, 4);
            let weak = Arc::downgrade(&listener) as Weak<dyn CacheFileListener>;
            let init = file.init(create_new, false, false, weak).unwrap();
            if create_new {
                assert_eq!(init, FileInit::Ready);
                return (file, listener, true);
            }
            assert_eq!(init, FileInit::Pending);
            let (result, is_new) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            result.unwrap();
            (file, listener, is_new)
        }

        /// Wait until the I/O thread went idle
        fn sync(&self) {
            for _ in 0..3 {
                let (tx, rx) = mpsc::channel();
                self.io
                    .io_thread()
                    .dispatch(IoLevel::Evict, move || tx.send(()).unwrap())
                    .unwrap();
                rx.recv_timeout(Duration::from_secs(5)).unwrap();
            }
        }
    }

    fn read_all(file: &Arc<CacheFile>, offset: u64) -> CacheResult<Vec<u8>> {
        let input = file.open_input_stream(offset)?;
        let mut out = Vec::new();
        let mut buf = [0u8; 1000];
        for _ in 0..10_000 {
            match input.read(&mut buf) {
                Ok(0) => return Ok(out),
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(CacheError::WouldBlock) => std::thread::sleep(Duration::from_millis(1)),
                Err(e) => return Err(e),
            }
        }
        panic!("read never finished");
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_memory_only_write_read() {
        let env = Env::new();
        let (tx, _rx) = mpsc::channel();
        let listener = Arc::new(TestListener(Mutex::new(tx)));
        let file = CacheFile::new(env.io.clone(), "mem", 4);
        let weak = Arc::downgrade(&listener) as Weak<dyn CacheFileListener>;
        assert_eq!(file.init(true, true, false, weak).unwrap(), FileInit::Ready);

        let data = pattern(10_000);
        let output = file.open_output_stream(0).unwrap();
        assert_eq!(output.write(&data).unwrap(), data.len());
        output.close();

        assert_eq!(file.data_size(), 10_000);
        assert_eq!(read_all(&file, 0).unwrap(), data);
        assert_eq!(read_all(&file, 9_990).unwrap(), &data[9_990..]);
        assert!(file.throw_memory_cached_data().is_err());
        assert!(file.memory_size() >= 10_000);
    }

    #[test]
    fn test_write_close_reopen_read() {
        let env = Env::new();
        let data = pattern(4100);
        {
            let (file, _l, is_new) = env.open("k", true);
            assert!(is_new);
            file.set_element("charset", Some("utf-8")).unwrap();
            let output = file.open_output_stream(0).unwrap();
            output.write(&data[..4096]).unwrap();
            output.write(&data[4096..]).unwrap();
            output.close();
            env.sync();
        }
        env.sync();

        let (file, _l, is_new) = env.open("k", false);
        assert!(!is_new);
        assert_eq!(file.data_size(), 4100);
        assert_eq!(file.get_element("charset").as_deref(), Some("utf-8"));
        assert_eq!(read_all(&file, 0).unwrap(), data);
    }

    #[test]
    fn test_reader_waits_for_writer() {
        let env = Env::new();
        let (file, _l, _) = env.open("live", true);

        let input = file.open_input_stream(0).unwrap();
        let output = file.open_output_stream(0).unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(input.read(&mut buf), Err(CacheError::WouldBlock)));

        let (tx, rx) = mpsc::channel();
        input
            .async_wait(Some(Box::new(move || tx.send(()).unwrap())))
            .unwrap();
        assert!(rx.try_recv().is_err());

        output.write(b"hello").unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(input.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");

        assert!(matches!(input.read(&mut buf), Err(CacheError::WouldBlock)));
        let (tx, rx) = mpsc::channel();
        input
            .async_wait(Some(Box::new(move || tx.send(()).unwrap())))
            .unwrap();
        output.close();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(input.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_cancel_async_wait() {
        let env = Env::new();
        let (file, _l, _) = env.open("cancel", true);
        let input = file.open_input_stream(0).unwrap();
        let output = file.open_output_stream(0).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(input.read(&mut buf), Err(CacheError::WouldBlock)));

        let (tx, rx) = mpsc::channel();
        input
            .async_wait(Some(Box::new(move || tx.send(()).unwrap())))
            .unwrap();
        input.async_wait(None).unwrap();
        output.write(b"data").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_gap_reads_as_zeros() {
        let env = Env::new();
        {
            let (file, _l, _) = env.open("gap", true);
            let output = file.open_output_stream(0).unwrap();
            output.write(b"head").unwrap();
            output.seek(SeekFrom::Start(3 * CHUNK_SIZE_U64 + 10)).unwrap();
            output.write(b"tail").unwrap();
            output.close();
            assert_eq!(file.data_size(), 3 * CHUNK_SIZE_U64 + 14);
            env.sync();
        }
        env.sync();

        let (file, _l, _) = env.open("gap", false);
        let data = read_all(&file, 0).unwrap();
        assert_eq!(data.len(), 3 * CHUNK_SIZE + 14);
        assert_eq!(&data[..4], b"head");
        assert!(data[4..3 * CHUNK_SIZE + 10].iter().all(|&b| b == 0));
        assert_eq!(&data[3 * CHUNK_SIZE + 10..], b"tail");
    }

    #[test]
    fn test_gap_reads_as_zeros_while_writer_open() {
        let env = Env::new();
        let (file, _l, _) = env.open("gap2", true);
        let output = file.open_output_stream(0).unwrap();
        output.write(b"head").unwrap();
        output.seek(SeekFrom::Start(3 * CHUNK_SIZE_U64 + 10)).unwrap();
        output.write(b"tail").unwrap();

        // The gap is below the end, so the open writer never makes it wait
        let input = file.open_input_stream(CHUNK_SIZE_U64).unwrap();
        let mut gap = Vec::new();
        let mut buf = [0u8; 1000];
        for _ in 0..10_000 {
            if gap.len() >= 2 * CHUNK_SIZE {
                break;
            }
            let want = (2 * CHUNK_SIZE - gap.len()).min(buf.len());
            match input.read(&mut buf[..want]) {
                Ok(n) => {
                    assert!(n > 0, "gap ended early at {}", gap.len());
                    gap.extend_from_slice(&buf[..n]);
                }
                Err(CacheError::WouldBlock) => std::thread::sleep(Duration::from_millis(1)),
                Err(e) => panic!("gap read failed: {}", e),
            }
        }
        assert_eq!(gap.len(), 2 * CHUNK_SIZE);
        assert!(gap.iter().all(|&b| b == 0));
        drop(input);

        output.close();
        let data = read_all(&file, 0).unwrap();
        assert_eq!(data.len(), 3 * CHUNK_SIZE + 14);
        assert_eq!(&data[..4], b"head");
        assert!(data[4..3 * CHUNK_SIZE + 10].iter().all(|&b| b == 0));
        assert_eq!(&data[3 * CHUNK_SIZE + 10..], b"tail");

        env.sync();
        drop(file);
        env.sync();
        let (file, _l, _) = env.open("gap2", false);
        assert_eq!(read_all(&file, 0).unwrap(), data);
    }

    #[test]
    fn test_failed_chunk_write_keeps_other_chunks() {
        let env = Env::new();
        let (file, _l, _) = env.open("wfail", true);
        env.sync();

        // Hold the I/O thread so the chunk writes stay queued
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        env.io
            .io_thread()
            .dispatch(IoLevel::OpenPriority, move || {
                let _ = gate_rx.recv_timeout(Duration::from_secs(5));
            })
            .unwrap();

        let data = pattern(3 * CHUNK_SIZE);
        let output = file.open_output_stream(0).unwrap();
        output.write(&data).unwrap();
        output.close();

        let before = file.state.lock().metadata.get_hash(1);
        file.on_chunk_written(
            1,
            hash16(&data[CHUNK_SIZE..2 * CHUNK_SIZE]),
            Err(CacheError::NotAvailable),
        );
        {
            let st = file.state.lock();
            let slot = st.chunks.get(&1).unwrap();
            assert!(slot.chunk.is_dirty());
            assert!(!slot.writing);
            assert_eq!(st.metadata.get_hash(1), before);
        }
        assert_eq!(read_all(&file, 0).unwrap(), data);

        gate_tx.send(()).unwrap();
        env.sync();
        drop(file);
        env.sync();

        let (file, _l, _) = env.open("wfail", false);
        assert_eq!(read_all(&file, 0).unwrap(), data);
    }

    #[test]
    fn test_corrupted_chunk_detected() {
        let env = Env::new();
        {
            let (file, _l, _) = env.open("bad", true);
            let output = file.open_output_stream(0).unwrap();
            output.write(&pattern(6000)).unwrap();
            output.close();
            env.sync();
        }
        env.sync();

        let path = env
            .dir
            .path()
            .join(ENTRIES_DIR)
            .join(CacheHash::from_key("bad").to_hex());
        let mut raw = std::fs::read(&path).unwrap();
        raw[100] ^= 0xFF;
        std::fs::write(&path, raw).unwrap();

        let (file, _l, _) = env.open("bad", false);
        assert!(matches!(
            read_all(&file, 0),
            Err(CacheError::FileCorrupted { index: 0 })
        ));
    }

    #[test]
    fn test_single_output_stream() {
        let env = Env::new();
        let (file, _l, _) = env.open("one", true);
        let first = file.open_output_stream(0).unwrap();
        assert!(matches!(
            file.open_output_stream(0),
            Err(CacheError::NotAvailable)
        ));
        first.close();
        assert!(file.open_output_stream(0).is_ok());
    }

    #[test]
    fn test_reader_past_end_without_writer_is_eof() {
        let env = Env::new();
        let (file, _l, _) = env.open("eof", true);
        let input = file.open_input_stream(100).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(input.read(&mut buf).unwrap(), 0);
    }
}
