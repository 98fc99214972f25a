//! Expiry Service
//!
//! Lifecycle of the two expiry daemons of one message store: the expirer
//! starts first so that items rehydrated by the cache loader can register
//! with it, and the cache loader starts last.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Properties;
use crate::error::Result;
use crate::expiry::{AlarmScheduler, CacheLoader, Expirer};
use crate::observability::DumpNode;
use crate::storage::{LinkRegistry, MemoryStore, Persistence, TransactionFactory};

/// Expirer and cache loader of one message store
pub struct ExpiryService {
    name: String,
    expirer: Expirer,
    cache_loader: CacheLoader,
    expiry_interval: Mutex<Option<u64>>,
    cache_loader_interval: Mutex<Option<u64>>,
}

impl ExpiryService {
    /// Create a stopped service over the given store collaborators
    pub fn new(
        name: impl Into<String>,
        properties: Properties,
        transactions: Arc<dyn TransactionFactory>,
        persistence: Arc<dyn Persistence>,
        links: Arc<dyn LinkRegistry>,
        scheduler: AlarmScheduler,
    ) -> Self {
        let name = name.into();
        let expirer = Expirer::new(&name, properties.clone(), transactions, scheduler.clone());
        let cache_loader = CacheLoader::new(&name, properties, persistence, links, scheduler);
        Self {
            name,
            expirer,
            cache_loader,
            expiry_interval: Mutex::new(None),
            cache_loader_interval: Mutex::new(None),
        }
    }

    /// Service over a `MemoryStore`; items the store registers from now on
    /// are tracked by this service's expirer.
    pub fn for_memory_store(
        name: impl Into<String>,
        properties: Properties,
        store: &MemoryStore,
        scheduler: AlarmScheduler,
    ) -> Self {
        let service = Self::new(
            name,
            properties,
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            scheduler,
        );
        store.attach_expirer(service.expirer.clone());
        service
    }

    /// Expiry interval (ms) used at the next start instead of the property
    pub fn set_expiry_interval(&self, millis: u64) {
        *self.expiry_interval.lock() = Some(millis);
    }

    /// Cache loader interval (s) used at the next start instead of the property
    pub fn set_cache_loader_interval(&self, secs: u64) {
        *self.cache_loader_interval.lock() = Some(secs);
    }

    /// Start the expirer, then the cache loader
    pub fn start(&self) -> Result<()> {
        let expiry_interval = *self.expiry_interval.lock();
        let cache_loader_interval = *self.cache_loader_interval.lock();

        self.expirer.start(expiry_interval)?;
        if let Err(err) = self.cache_loader.start(cache_loader_interval) {
            warn!(store = %self.name, error = %err, "restart recovery failed");
            return Err(err);
        }
        info!(store = %self.name, "expiry service started");
        Ok(())
    }

    /// Stop both daemons
    pub fn stop(&self) {
        self.expirer.stop();
        self.cache_loader.stop();
        info!(store = %self.name, "expiry service stopped");
    }

    /// Get the expiry daemon
    pub fn expirer(&self) -> &Expirer {
        &self.expirer
    }

    /// Get the restart recovery daemon
    pub fn cache_loader(&self) -> &CacheLoader {
        &self.cache_loader
    }

    /// Whether items are currently allowed to expire
    pub fn items_can_expire(&self) -> bool {
        self.expirer.is_running()
    }

    /// Number of references in the expiry index
    pub fn expiry_index_size(&self) -> usize {
        self.expirer.size()
    }

    /// Diagnostic dump of both daemons
    pub fn dump(&self) -> DumpNode {
        DumpNode::new("message-store")
            .with_child(DumpNode::leaf("name", &self.name))
            .with_child(self.expirer.dump())
            .with_child(self.cache_loader.dump())
    }
}
