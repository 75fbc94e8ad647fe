//! Reactions to host notifications

use std::sync::{Arc, Weak};

use super::service::CacheStorageService;
use crate::entry::PurgeWhat;
use crate::error::{CacheError, CacheResult};

pub const MEMORY_PRESSURE_TOPIC: &str = "memory-pressure";
pub const LAST_PRIVATE_CONTEXT_TOPIC: &str = "last-pb-context-exited";
pub const SHUTDOWN_TOPIC: &str = "xpcom-shutdown";

/// Forwards host events to the storage service without keeping it alive
pub struct CacheObserver {
    service: Weak<CacheStorageService>,
}

impl CacheObserver {
    pub fn new(service: &Arc<CacheStorageService>) -> Self {
        Self {
            service: Arc::downgrade(service),
        }
    }

    fn service(&self) -> CacheResult<Arc<CacheStorageService>> {
        self.service.upgrade().ok_or(CacheError::NotInitialized)
    }

    /// Dispatch a notification by topic; unknown topics are ignored
    pub fn observe(&self, topic: &str) -> CacheResult<()> {
        match topic {
            MEMORY_PRESSURE_TOPIC => self.memory_pressure(),
            LAST_PRIVATE_CONTEXT_TOPIC => self.last_private_context_closed(),
            SHUTDOWN_TOPIC => {
                self.shutdown();
                Ok(())
            }
            _ => {
                tracing::trace!("Ignoring notification {}", topic);
                Ok(())
            }
        }
    }

    /// Drop every purgeable entry from memory
    pub fn memory_pressure(&self) -> CacheResult<()> {
        tracing::info!("Memory pressure, purging everything");
        self.service()?.purge_from_memory(PurgeWhat::Whole)
    }

    pub fn last_private_context_closed(&self) -> CacheResult<()> {
        tracing::info!("Last private context closed");
        self.service()?.drop_private_browsing_entries()
    }

    pub fn set_memory_limit_kb(&self, limit_kb: u64) -> CacheResult<()> {
        self.service()?.set_memory_limit_kb(limit_kb)
    }

    pub fn shutdown(&self) {
        if let Some(service) = self.service.upgrade() {
            service.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::storage::CacheUri;

    #[test]
    fn test_observer_topics() {
        let service = CacheStorageService::new(CacheConfig::default()).unwrap();
        let observer = CacheObserver::new(&service);

        observer.observe(MEMORY_PRESSURE_TOPIC).unwrap();
        observer.observe("something-else").unwrap();
        assert!(observer.set_memory_limit_kb(0).is_err());
        observer.set_memory_limit_kb(2048).unwrap();
        assert_eq!(service.memory_limit(), 2048 * 1024);

        observer.observe(SHUTDOWN_TOPIC).unwrap();
        assert!(service
            .add_storage_entry("", &CacheUri::parse("http://a/").unwrap(), "", true, true, false)
            .is_err());
    }

    #[test]
    fn test_private_entries_dropped() {
        let service = CacheStorageService::new(CacheConfig::default()).unwrap();
        let uri = CacheUri::parse("http://a/").unwrap();
        let private = service
            .add_storage_entry("p,", &uri, "", false, true, false)
            .unwrap()
            .unwrap();
        service
            .add_storage_entry("", &uri, "", false, true, false)
            .unwrap();

        CacheObserver::new(&service)
            .observe(LAST_PRIVATE_CONTEXT_TOPIC)
            .unwrap();
        assert_eq!(service.entry_count(), 1);
        service.shutdown();
        assert!(private.is_doomed());
    }

    #[test]
    fn test_observer_outlived_service() {
        let service = CacheStorageService::new(CacheConfig::default()).unwrap();
        let observer = CacheObserver::new(&service);
        drop(service);
        assert!(matches!(
            observer.memory_pressure(),
            Err(CacheError::NotInitialized)
        ));
    }
}
