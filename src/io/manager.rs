//! Asynchronous file primitives executed on the cache I/O thread
//!
//! Every operation is queued on [`CacheIoThread`] and reports back to a
//! [`CacheFileIoListener`] from the I/O thread. The handle registry is only
//! modified from the I/O thread.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::instrument;

use super::handle::{CacheFileHandle, HandleRegistry, HandleState};
use super::thread::{CacheIoThread, IoLevel};
use crate::constants::{DOOMED_DIR, ENTRIES_DIR};
use crate::error::{CacheError, CacheResult};
use crate::hash::CacheHash;

/// How [`CacheFileIoManager::open_file`] treats an existing file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Fail with `NotAvailable` when the file does not exist
    Open,
    /// Open the existing file or start a new one
    Create,
    /// Doom any existing handle and start from an empty file
    CreateNew,
}

/// Completion callbacks of the I/O manager, called on the I/O thread
///
/// Each request notifies exactly one method once.
pub trait CacheFileIoListener: Send + Sync {
    fn on_file_opened(&self, _result: CacheResult<Arc<CacheFileHandle>>) {}

    fn on_data_read(&self, _handle: &Arc<CacheFileHandle>, _result: CacheResult<Vec<u8>>) {}

    fn on_data_written(&self, _handle: &Arc<CacheFileHandle>, _result: CacheResult<()>) {}

    fn on_file_doomed(&self, _result: CacheResult<()>) {}
}

struct ManagerState {
    handles: HandleRegistry,
    tree_created: bool,
    shutdown: bool,
}

/// Owner of the I/O thread and the registry of open entry files
pub struct CacheFileIoManager {
    io_thread: CacheIoThread,
    cache_dir: Option<PathBuf>,
    state: Mutex<ManagerState>,
    self_ref: Weak<CacheFileIoManager>,
}

impl CacheFileIoManager {
    /// Start the I/O thread
    ///
    /// # Arguments
    /// * `cache_dir` - Cache root; `None` makes every open fail with
    ///   `NotAvailable` so that files fall back to memory-only mode
    pub fn init(cache_dir: Option<PathBuf>) -> CacheResult<Arc<Self>> {
        let io_thread = CacheIoThread::new()?;
        tracing::info!(
            "Cache I/O manager initialized, cache dir: {:?}",
            cache_dir.as_deref()
        );

        Ok(Arc::new_cyclic(|self_ref| Self {
            io_thread,
            cache_dir,
            state: Mutex::new(ManagerState {
                handles: HandleRegistry::new(),
                tree_created: false,
                shutdown: false,
            }),
            self_ref: self_ref.clone(),
        }))
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    pub fn io_thread(&self) -> &CacheIoThread {
        &self.io_thread
    }

    fn this(&self) -> CacheResult<Arc<Self>> {
        self.self_ref.upgrade().ok_or(CacheError::NotInitialized)
    }

    /// Open (or create) the file for `key`
    ///
    /// The listener receives the handle; it must be given back with
    /// [`release_handle`](Self::release_handle).
    pub fn open_file(
        &self,
        key: &str,
        mode: OpenMode,
        priority: bool,
        listener: Arc<dyn CacheFileIoListener>,
    ) -> CacheResult<()> {
        let hash = CacheHash::from_key(key);
        let level = if priority {
            IoLevel::OpenPriority
        } else if mode == OpenMode::CreateNew {
            IoLevel::OpenTruncate
        } else {
            IoLevel::Open
        };

        tracing::trace!("open_file key={} hash={} mode={:?}", key, hash, mode);

        let this = self.this()?;
        self.io_thread.dispatch(level, move || {
            let result = this.open_file_internal(&hash, mode, priority);
            listener.on_file_opened(result);
        })
    }

    #[instrument(level = "trace", skip(self), fields(hash = %hash))]
    fn open_file_internal(
        &self,
        hash: &CacheHash,
        mode: OpenMode,
        priority: bool,
    ) -> CacheResult<Arc<CacheFileHandle>> {
        let cache_dir = self.cache_dir.as_deref().ok_or(CacheError::NotAvailable)?;

        let mut state = self.state.lock();
        if state.shutdown {
            return Err(CacheError::NotInitialized);
        }
        if !state.tree_created {
            create_cache_tree(cache_dir)?;
            state.tree_created = true;
        }

        let path = cache_dir.join(ENTRIES_DIR).join(hash.to_hex());
        let existing = state.handles.get_handle(hash);

        if mode == OpenMode::CreateNew {
            if let Some(old) = existing {
                self.doom_file_internal(&old)?;
            }

            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!("Cannot remove old entry file {}: {}", path.display(), e);
                }
            }

            let handle = state.handles.new_handle(*hash, &path, priority);
            {
                let mut hs = handle.state();
                hs.file_size = 0;
                hs.file_exists = false;
                hs.consumers = 1;
            }
            tracing::debug!("Created new handle for {}", hash);
            return Ok(handle);
        }

        if let Some(handle) = existing {
            handle.state().consumers += 1;
            return Ok(handle);
        }

        let exists = path.exists();
        if !exists && mode == OpenMode::Open {
            return Err(CacheError::NotAvailable);
        }

        let handle = state.handles.new_handle(*hash, &path, priority);
        {
            let mut hs = handle.state();
            if exists {
                let file = OpenOptions::new().read(true).write(true).open(&path);
                let file = match file {
                    Ok(file) => file,
                    Err(e) => {
                        drop(hs);
                        state.handles.remove_handle(&handle);
                        return Err(e.into());
                    }
                };
                hs.file_size = file.metadata()?.len();
                hs.file = Some(file);
                hs.file_exists = true;
            }
            hs.consumers = 1;
        }

        tracing::debug!("Opened handle for {} (exists: {})", hash, exists);
        Ok(handle)
    }

    /// Read exactly `len` bytes at `offset`
    ///
    /// Fails with `NotAvailable` when the file was never created and with
    /// an I/O error on a short read.
    pub fn read(
        &self,
        handle: &Arc<CacheFileHandle>,
        offset: u64,
        len: usize,
        listener: Arc<dyn CacheFileIoListener>,
    ) -> CacheResult<()> {
        let level = if handle.is_priority() {
            IoLevel::ReadPriority
        } else {
            IoLevel::Read
        };
        let handle = handle.clone();
        self.io_thread.dispatch(level, move || {
            let result = read_internal(&handle, offset, len);
            listener.on_data_read(&handle, result);
        })
    }

    /// Write `data` at `offset`, creating the file on first write
    ///
    /// With `truncate` the file is cut right after the written range.
    pub fn write(
        &self,
        handle: &Arc<CacheFileHandle>,
        offset: u64,
        data: Bytes,
        truncate: bool,
        listener: Option<Arc<dyn CacheFileIoListener>>,
    ) -> CacheResult<()> {
        let handle = handle.clone();
        let this = self.this()?;
        self.io_thread.dispatch(IoLevel::Write, move || {
            let result = this.write_internal(&handle, offset, &data, truncate);
            if let Err(e) = &result {
                tracing::warn!("Write to {} at {} failed: {}", handle.hash(), offset, e);
            }
            if let Some(listener) = listener {
                listener.on_data_written(&handle, result);
            }
        })
    }

    #[instrument(level = "trace", skip(self, handle, data), fields(hash = %handle.hash(), len = data.len()))]
    fn write_internal(
        &self,
        handle: &Arc<CacheFileHandle>,
        offset: u64,
        data: &[u8],
        truncate: bool,
    ) -> CacheResult<()> {
        let mut hs = handle.state();
        if hs.closed {
            return Err(CacheError::NotAvailable);
        }
        if hs.file.is_none() {
            self.create_file(&mut hs)?;
        }

        let file = hs.file.as_mut().ok_or(CacheError::NotAvailable)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;

        let end = offset + data.len() as u64;
        if truncate {
            file.set_len(end)?;
            hs.file_size = end;
        } else if hs.file_size < end {
            hs.file_size = end;
        }
        Ok(())
    }

    /// Cut the backing file to `size` bytes, if it exists
    pub fn truncate(&self, handle: &Arc<CacheFileHandle>, size: u64) -> CacheResult<()> {
        let handle = handle.clone();
        self.io_thread.dispatch(IoLevel::Write, move || {
            let mut hs = handle.state();
            if let Some(file) = hs.file.as_mut() {
                match file.set_len(size) {
                    Ok(()) => hs.file_size = size,
                    Err(e) => tracing::warn!("Truncate of {} failed: {}", handle.hash(), e),
                }
            }
        })
    }

    fn create_file(&self, hs: &mut HandleState) -> CacheResult<()> {
        if hs.doomed {
            hs.path = self.doomed_path()?;
        } else if hs.path.exists() {
            tracing::warn!("Found a file that should not exist: {}", hs.path.display());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&hs.path)?;
        hs.file = Some(file);
        hs.file_size = 0;
        hs.file_exists = true;
        Ok(())
    }

    /// Move the handle's file aside and mark it doomed
    ///
    /// A doomed handle is skipped by lookups, so a following `CreateNew`
    /// for the same key gets a fresh handle.
    pub fn doom_file(
        &self,
        handle: &Arc<CacheFileHandle>,
        listener: Option<Arc<dyn CacheFileIoListener>>,
    ) -> CacheResult<()> {
        let level = if handle.is_priority() {
            IoLevel::OpenPriority
        } else {
            IoLevel::Open
        };
        let handle = handle.clone();
        let this = self.this()?;
        self.io_thread.dispatch(level, move || {
            let result = this.doom_file_internal(&handle);
            if let Some(listener) = listener {
                listener.on_file_doomed(result);
            }
        })
    }

    fn doom_file_internal(&self, handle: &Arc<CacheFileHandle>) -> CacheResult<()> {
        let mut hs = handle.state();
        if hs.doomed {
            return Ok(());
        }

        if hs.file.take().is_some() {
            let doomed = self.doomed_path()?;
            std::fs::rename(&hs.path, &doomed)?;
            hs.path = doomed;
            hs.file = Some(OpenOptions::new().read(true).write(true).open(&hs.path)?);
        }

        hs.doomed = true;
        tracing::debug!("Doomed handle {} -> {}", handle.hash(), hs.path.display());
        Ok(())
    }

    /// Doom the file stored for `key`, whether or not it is open
    pub fn doom_file_by_key(
        &self,
        key: &str,
        listener: Option<Arc<dyn CacheFileIoListener>>,
    ) -> CacheResult<()> {
        let hash = CacheHash::from_key(key);
        let this = self.this()?;
        self.io_thread.dispatch(IoLevel::Open, move || {
            let result = this.doom_file_by_hash_internal(&hash);
            if let Some(listener) = listener {
                listener.on_file_doomed(result);
            }
        })
    }

    fn doom_file_by_hash_internal(&self, hash: &CacheHash) -> CacheResult<()> {
        let cache_dir = self.cache_dir.as_deref().ok_or(CacheError::NotAvailable)?;

        let handle = self.state.lock().handles.get_handle(hash);
        if let Some(handle) = handle {
            return self.doom_file_internal(&handle);
        }

        let path = cache_dir.join(ENTRIES_DIR).join(hash.to_hex());
        if !path.exists() {
            return Err(CacheError::NotAvailable);
        }
        std::fs::remove_file(&path)?;
        Ok(())
    }

    /// Give back a handle obtained from `open_file`
    ///
    /// When the last consumer releases it the descriptor is closed on the
    /// I/O thread, and a doomed file is removed from disk.
    pub fn release_handle(&self, handle: Arc<CacheFileHandle>) {
        {
            let mut hs = handle.state();
            hs.consumers = hs.consumers.saturating_sub(1);
            if hs.consumers > 0 {
                return;
            }
        }

        let Ok(this) = self.this() else {
            return;
        };
        let close_handle = handle.clone();
        if self
            .io_thread
            .dispatch(IoLevel::Close, move || this.close_handle_internal(&close_handle))
            .is_err()
        {
            tracing::debug!("I/O thread gone, closing {} in place", handle.hash());
            self.close_handle_internal(&handle);
        }
    }

    fn close_handle_internal(&self, handle: &Arc<CacheFileHandle>) {
        let mut state = self.state.lock();
        {
            let mut hs = handle.state();
            // Someone reopened the handle after the close was scheduled
            if hs.consumers > 0 || hs.closed {
                return;
            }
            close_handle_state(&mut hs);
        }
        state.handles.remove_handle(handle);
        tracing::trace!("Closed handle {}", handle.hash());
    }

    /// Doom every live file and delete every unopened file under `entries/`
    pub fn evict_all(&self, listener: Option<Arc<dyn CacheFileIoListener>>) -> CacheResult<()> {
        let this = self.this()?;
        self.io_thread.dispatch(IoLevel::Evict, move || {
            let files = match this.list_entry_files() {
                Ok(files) => files,
                Err(e) => {
                    if let Some(listener) = listener {
                        listener.on_file_doomed(Err(e));
                    }
                    return;
                }
            };
            this.evict_files(files, listener);
        })
    }

    fn list_entry_files(&self) -> CacheResult<Vec<PathBuf>> {
        let cache_dir = self.cache_dir.as_deref().ok_or(CacheError::NotAvailable)?;
        let entries = cache_dir.join(ENTRIES_DIR);
        if !entries.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for dirent in std::fs::read_dir(entries)? {
            files.push(dirent?.path());
        }
        Ok(files)
    }

    fn evict_files(
        self: &Arc<Self>,
        mut files: Vec<PathBuf>,
        listener: Option<Arc<dyn CacheFileIoListener>>,
    ) {
        while let Some(path) = files.pop() {
            let hash = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(CacheHash::from_hex);

            let handle = hash.and_then(|h| self.state.lock().handles.get_handle(&h));
            let result = match handle {
                Some(handle) => self.doom_file_internal(&handle),
                None => std::fs::remove_file(&path).map_err(CacheError::from),
            };
            if let Err(e) = result {
                tracing::warn!("Cannot evict {}: {}", path.display(), e);
            }

            if !files.is_empty() && self.io_thread.yield_requested() {
                let this = self.clone();
                let remaining = files.len();
                if let Err(e) = self
                    .io_thread
                    .dispatch(IoLevel::Evict, move || this.evict_files(files, listener))
                {
                    tracing::warn!("Eviction stopped with {} files left: {}", remaining, e);
                }
                return;
            }
        }

        tracing::debug!("Evicted all entry files");
        if let Some(listener) = listener {
            listener.on_file_doomed(Ok(()));
        }
    }

    /// Number of handles in the registry, doomed ones included
    pub fn handle_count(&self) -> usize {
        self.state.lock().handles.len()
    }

    /// Number of live handles registered for `key`
    pub fn live_handle_count(&self, key: &str) -> usize {
        self.state
            .lock()
            .handles
            .live_handle_count(&CacheHash::from_key(key))
    }

    /// Close every handle and stop the I/O thread
    ///
    /// Events already queued still run first.
    pub fn shutdown(&self) {
        if let Ok(this) = self.this() {
            let _ = self
                .io_thread
                .dispatch(IoLevel::Evict, move || this.shutdown_internal());
        }
        self.io_thread.shutdown();
        tracing::info!("Cache I/O manager shut down");
    }

    fn shutdown_internal(&self) {
        let mut state = self.state.lock();
        for handle in state.handles.all_handles() {
            let mut hs = handle.state();
            if !hs.closed {
                close_handle_state(&mut hs);
            }
            drop(hs);
            state.handles.remove_handle(&handle);
        }
        state.shutdown = true;
    }

    fn doomed_path(&self) -> CacheResult<PathBuf> {
        let cache_dir = self.cache_dir.as_deref().ok_or(CacheError::NotAvailable)?;
        let doomed_dir = cache_dir.join(DOOMED_DIR);
        loop {
            let candidate = doomed_dir.join(rand::random::<u32>().to_string());
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
    }
}

fn close_handle_state(hs: &mut HandleState) {
    hs.closed = true;
    hs.file = None;
    if hs.doomed && hs.file_exists {
        if let Err(e) = std::fs::remove_file(&hs.path) {
            tracing::warn!("Cannot remove doomed file {}: {}", hs.path.display(), e);
        }
    }
}

fn read_internal(handle: &Arc<CacheFileHandle>, offset: u64, len: usize) -> CacheResult<Vec<u8>> {
    let mut hs = handle.state();
    let file: &mut File = match hs.file.as_mut() {
        Some(file) => file,
        None => {
            tracing::warn!("Trying to read from non-existent file {}", handle.hash());
            return Err(CacheError::NotAvailable);
        }
    };

    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

fn create_cache_tree(cache_dir: &Path) -> CacheResult<()> {
    for dir in [
        cache_dir.to_path_buf(),
        cache_dir.join(ENTRIES_DIR),
        cache_dir.join(DOOMED_DIR),
    ] {
        if !dir.exists() {
            std::fs::create_dir_all(&dir).map_err(|e| {
                tracing::warn!("Cannot create directory {}: {}", dir.display(), e);
                CacheError::from(e)
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    enum Event {
        Opened(CacheResult<Arc<CacheFileHandle>>),
        Read(CacheResult<Vec<u8>>),
        Written(CacheResult<()>),
        Doomed(CacheResult<()>),
    }

    struct ChannelListener(Mutex<mpsc::Sender<Event>>);

    impl CacheFileIoListener for ChannelListener {
        fn on_file_opened(&self, result: CacheResult<Arc<CacheFileHandle>>) {
            let _ = self.0.lock().send(Event::Opened(result));
        }
        fn on_data_read(&self, _: &Arc<CacheFileHandle>, result: CacheResult<Vec<u8>>) {
            let _ = self.0.lock().send(Event::Read(result));
        }
        fn on_data_written(&self, _: &Arc<CacheFileHandle>, result: CacheResult<()>) {
            let _ = self.0.lock().send(Event::Written(result));
        }
        fn on_file_doomed(&self, result: CacheResult<()>) {
            let _ = self.0.lock().send(Event::Doomed(result));
        }
    }

    struct Harness {
        _dir: TempDir,
        root: PathBuf,
        manager: Arc<CacheFileIoManager>,
        listener: Arc<ChannelListener>,
        rx: mpsc::Receiver<Event>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let root = dir.path().join("cache2");
            let manager = CacheFileIoManager::init(Some(root.clone())).unwrap();
            let (tx, rx) = mpsc::channel();
            Self {
                _dir: dir,
                root,
                manager,
                listener: Arc::new(ChannelListener(Mutex::new(tx))),
                rx,
            }
        }

        fn next(&self) -> Event {
            self.rx.recv_timeout(Duration::from_secs(5)).unwrap()
        }

        fn open(&self, key: &str, mode: OpenMode) -> CacheResult<Arc<CacheFileHandle>> {
            self.manager
                .open_file(key, mode, false, self.listener.clone())
                .unwrap();
            match self.next() {
                Event::Opened(r) => r,
                _ => panic!("unexpected event"),
            }
        }

        fn write(&self, handle: &Arc<CacheFileHandle>, offset: u64, data: &[u8]) -> CacheResult<()> {
            self.manager
                .write(handle, offset, Bytes::copy_from_slice(data), false, Some(self.listener.clone()))
                .unwrap();
            match self.next() {
                Event::Written(r) => r,
                _ => panic!("unexpected event"),
            }
        }

        fn read(&self, handle: &Arc<CacheFileHandle>, offset: u64, len: usize) -> CacheResult<Vec<u8>> {
            self.manager
                .read(handle, offset, len, self.listener.clone())
                .unwrap();
            match self.next() {
                Event::Read(r) => r,
                _ => panic!("unexpected event"),
            }
        }

        fn doom(&self, handle: &Arc<CacheFileHandle>) -> CacheResult<()> {
            self.manager
                .doom_file(handle, Some(self.listener.clone()))
                .unwrap();
            match self.next() {
                Event::Doomed(r) => r,
                _ => panic!("unexpected event"),
            }
        }

        /// Wait until everything queued so far has run
        fn sync(&self) {
            let (tx, rx) = mpsc::channel();
            self.manager
                .io_thread()
                .dispatch(IoLevel::Evict, move || tx.send(()).unwrap())
                .unwrap();
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
    }

    #[test]
    fn test_open_unknown_fails() {
        let h = Harness::new();
        assert!(matches!(h.open("missing", OpenMode::Open), Err(CacheError::NotAvailable)));
    }

    #[test]
    fn test_no_cache_dir_is_not_available() {
        let manager = CacheFileIoManager::init(None).unwrap();
        let (tx, rx) = mpsc::channel();
        let listener = Arc::new(ChannelListener(Mutex::new(tx)));
        manager.open_file("k", OpenMode::Create, false, listener).unwrap();
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Event::Opened(Err(CacheError::NotAvailable)) => {}
            _ => panic!("expected NotAvailable"),
        }
    }

    #[test]
    fn test_write_then_read() {
        let h = Harness::new();
        let handle = h.open("key", OpenMode::Create).unwrap();

        // Nothing on disk yet
        assert!(matches!(h.read(&handle, 0, 1), Err(CacheError::NotAvailable)));

        h.write(&handle, 0, b"hello world").unwrap();
        assert_eq!(handle.file_size(), 11);
        assert_eq!(h.read(&handle, 6, 5).unwrap(), b"world");

        // Short reads are errors
        assert!(matches!(h.read(&handle, 6, 100), Err(CacheError::Io(_))));

        let path = h.root.join(ENTRIES_DIR).join(CacheHash::from_key("key").to_hex());
        assert!(path.exists());
    }

    #[test]
    fn test_existing_file_is_reopened() {
        let h = Harness::new();
        let handle = h.open("key", OpenMode::CreateNew).unwrap();
        h.write(&handle, 0, b"persisted").unwrap();
        h.manager.release_handle(handle);
        h.sync();
        assert_eq!(h.manager.handle_count(), 0);

        let handle = h.open("key", OpenMode::Open).unwrap();
        assert_eq!(handle.file_size(), 9);
        assert_eq!(h.read(&handle, 0, 9).unwrap(), b"persisted");
    }

    #[test]
    fn test_create_new_dooms_and_truncates() {
        let h = Harness::new();
        let old = h.open("key", OpenMode::Create).unwrap();
        h.write(&old, 0, b"old data").unwrap();

        let new = h.open("key", OpenMode::CreateNew).unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(old.is_doomed());
        assert_eq!(new.file_size(), 0);
        assert_eq!(h.manager.live_handle_count("key"), 1);

        // The doomed handle still serves its old content from the doomed dir
        assert!(old.path().starts_with(h.root.join(DOOMED_DIR)));
        assert_eq!(h.read(&old, 0, 3).unwrap(), b"old");

        let doomed_path = old.path();
        h.manager.release_handle(old);
        h.sync();
        assert!(!doomed_path.exists());
        assert_eq!(h.manager.handle_count(), 1);
    }

    #[test]
    fn test_doom_file() {
        let h = Harness::new();
        let handle = h.open("key", OpenMode::Create).unwrap();
        h.write(&handle, 0, b"data").unwrap();
        h.doom(&handle).unwrap();
        assert!(handle.is_doomed());
        assert!(matches!(h.open("key", OpenMode::Open), Err(CacheError::NotAvailable)));

        // Dooming twice is a no-op
        h.doom(&handle).unwrap();
    }

    #[test]
    fn test_release_rechecks_consumers() {
        let h = Harness::new();
        let first = h.open("key", OpenMode::Create).unwrap();
        let second = h.open("key", OpenMode::Create).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        h.manager.release_handle(first);
        h.sync();
        assert!(!second.is_closed());
        assert_eq!(h.manager.handle_count(), 1);

        h.manager.release_handle(second.clone());
        h.sync();
        assert!(second.is_closed());
        assert_eq!(h.manager.handle_count(), 0);
    }

    #[test]
    fn test_write_truncate() {
        let h = Harness::new();
        let handle = h.open("key", OpenMode::Create).unwrap();
        h.write(&handle, 0, &[7u8; 100]).unwrap();

        h.manager
            .write(&handle, 10, Bytes::from_static(b"end"), true, Some(h.listener.clone()))
            .unwrap();
        assert!(matches!(h.next(), Event::Written(Ok(()))));
        assert_eq!(handle.file_size(), 13);
    }

    #[test]
    fn test_evict_all() {
        let h = Harness::new();
        for key in ["a", "b", "c"] {
            let handle = h.open(key, OpenMode::Create).unwrap();
            h.write(&handle, 0, key.as_bytes()).unwrap();
            h.manager.release_handle(handle);
        }
        let open = h.open("d", OpenMode::Create).unwrap();
        h.write(&open, 0, b"d").unwrap();

        h.manager.evict_all(Some(h.listener.clone())).unwrap();
        assert!(matches!(h.next(), Event::Doomed(Ok(()))));

        let remaining = std::fs::read_dir(h.root.join(ENTRIES_DIR)).unwrap().count();
        assert_eq!(remaining, 0);
        assert!(open.is_doomed());
    }
}
