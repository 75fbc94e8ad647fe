//! Per-context storage facade

use std::sync::Arc;

use super::context::{CacheUri, LoadContextInfo};
use super::service::CacheStorageService;
use crate::entry::{CacheEntryDoomCallback, CacheEntryOpenCallback, CacheStorageVisitor};
use crate::error::{CacheError, CacheResult};

/// Flags of [`CacheStorage::async_open_uri`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const OPEN_NORMALLY: OpenFlags = OpenFlags(0);
    /// Throw away any existing entry and start a new one
    pub const OPEN_TRUNCATE: OpenFlags = OpenFlags(1 << 0);
    /// Never become the writer; a missing entry is reported as not found
    pub const OPEN_READONLY: OpenFlags = OpenFlags(1 << 1);
    /// Use the priority I/O queues
    pub const OPEN_PRIORITY: OpenFlags = OpenFlags(1 << 2);
    /// Fail with `NotAvailable` instead of waiting for a writer
    pub const OPEN_BYPASS_IF_BUSY: OpenFlags = OpenFlags(1 << 3);

    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

/// Entries of one load context, on disk or in memory only
#[derive(Clone)]
pub struct CacheStorage {
    service: Arc<CacheStorageService>,
    info: LoadContextInfo,
    write_to_disk: bool,
}

impl CacheStorage {
    pub(crate) fn new(
        service: Arc<CacheStorageService>,
        info: LoadContextInfo,
        write_to_disk: bool,
    ) -> Self {
        Self {
            service,
            info,
            write_to_disk,
        }
    }

    pub fn context(&self) -> &LoadContextInfo {
        &self.info
    }

    pub fn writes_to_disk(&self) -> bool {
        self.write_to_disk
    }

    /// Open the entry for `uri` on behalf of `callback`
    ///
    /// # Arguments
    /// * `uri` - Resource URI; the fragment is ignored
    /// * `id_extension` - Distinguishes entries of one URI
    /// * `flags` - `OPEN_TRUNCATE` and `OPEN_READONLY` exclude each other
    /// * `callback` - Checks and receives the entry on the callback thread
    pub fn async_open_uri(
        &self,
        uri: &str,
        id_extension: &str,
        flags: OpenFlags,
        callback: Arc<dyn CacheEntryOpenCallback>,
    ) -> CacheResult<()> {
        let uri = CacheUri::parse(uri)?;
        let truncate = flags.contains(OpenFlags::OPEN_TRUNCATE);
        if truncate && flags.contains(OpenFlags::OPEN_READONLY) {
            return Err(CacheError::InvalidArgument(
                "truncate and read-only opens are exclusive".to_string(),
            ));
        }

        tracing::debug!(
            "CacheStorage::async_open_uri {} (context: '{}', flags: {:#x})",
            uri,
            self.info.key(),
            flags.bits()
        );

        let entry = self
            .service
            .add_storage_entry(
                &self.info.key(),
                &uri,
                id_extension,
                self.write_to_disk,
                true,
                truncate,
            )?
            .ok_or(CacheError::NotAvailable)?;

        entry.async_open(Some(callback), flags);
        Ok(())
    }

    pub fn async_doom_uri(
        &self,
        uri: &str,
        id_extension: &str,
        callback: Option<Arc<dyn CacheEntryDoomCallback>>,
    ) -> CacheResult<()> {
        let uri = CacheUri::parse(uri)?;
        self.service.doom_uri(
            &self.info.key(),
            &uri,
            id_extension,
            self.write_to_disk,
            callback,
        )
    }

    /// Doom every entry of this storage
    pub fn async_evict_storage(
        &self,
        callback: Option<Arc<dyn CacheEntryDoomCallback>>,
    ) -> CacheResult<()> {
        self.service
            .doom_storage_entries(&self.info.key(), self.write_to_disk, callback)
    }

    pub fn async_visit_storage(
        &self,
        visitor: Arc<dyn CacheStorageVisitor>,
        visit_entries: bool,
    ) -> CacheResult<()> {
        self.service.visit_storage(
            &self.info.key(),
            self.write_to_disk,
            visitor,
            visit_entries,
        )
    }
}

impl std::fmt::Debug for CacheStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStorage")
            .field("context", &self.info.key())
            .field("write_to_disk", &self.write_to_disk)
            .finish()
    }
}
