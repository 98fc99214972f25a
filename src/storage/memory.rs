//! In-Memory Message Store
//!
//! Reference implementation of the store collaborators. Every item has a
//! durable record (standing in for the persistence layer) and, while it is
//! resident, an in-memory `MemoryItem` owned by the store. Dropping the
//! resident copy (on release or restart) leaves only the durable record,
//! which a stream link can rehydrate later.

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use hashbrown::HashSet;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use super::{Link, LinkRegistry, Persistence, StreamId, Transaction, TransactionFactory};
use crate::error::{Result, StoreError};
use crate::expiry::{Expirable, Expirer};

/// Durable record of an item
#[derive(Debug, Clone)]
struct Record {
    stream: StreamId,
    expiry_time: i64,
    payload: Bytes,
}

struct StoreInner {
    next_item_id: AtomicI64,
    next_transaction_id: AtomicU64,
    records: DashMap<i64, Record>,
    resident: DashMap<i64, Arc<MemoryItem>>,
    pending: DashMap<u64, Vec<i64>>,
    expirer: RwLock<Option<Expirer>>,
}

impl StoreInner {
    fn register_with_expirer(&self, item: &Arc<MemoryItem>) -> Result<()> {
        if item.expiry_time == 0 {
            return Ok(());
        }
        if let Some(expirer) = self.expirer.read().as_ref() {
            let expirable: Arc<dyn Expirable> = item.clone();
            expirer.add_expirable(&expirable)?;
        }
        Ok(())
    }

    fn deregister_from_expirer(&self, item: &Arc<MemoryItem>) {
        if item.expiry_time == 0 {
            return;
        }
        if let Some(expirer) = self.expirer.read().as_ref() {
            let expirable: Arc<dyn Expirable> = item.clone();
            expirer.remove_expirable(&expirable);
        }
    }

    /// Make the item resident, reusing the resident copy if there is one
    fn rehydrate(self: &Arc<Self>, id: i64, record: &Record) -> (Arc<MemoryItem>, bool) {
        let mut created = false;
        let item = self
            .resident
            .entry(id)
            .or_insert_with(|| {
                created = true;
                Arc::new(MemoryItem {
                    id,
                    stream: record.stream,
                    expiry_time: record.expiry_time,
                    payload: record.payload.clone(),
                    store: Arc::downgrade(self),
                })
            })
            .clone();
        (item, created)
    }
}

/// A resident store item
#[derive(Debug)]
pub struct MemoryItem {
    id: i64,
    stream: StreamId,
    expiry_time: i64,
    payload: Bytes,
    store: Weak<StoreInner>,
}

impl MemoryItem {
    /// Stream the item belongs to
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl std::fmt::Debug for StoreInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreInner")
            .field("records", &self.records.len())
            .field("resident", &self.resident.len())
            .finish()
    }
}

impl Expirable for MemoryItem {
    fn expiry_time(&self) -> i64 {
        self.expiry_time
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn is_in_store(&self) -> bool {
        self.store
            .upgrade()
            .is_some_and(|store| store.records.contains_key(&self.id))
    }

    /// Declines while the item is not yet due; otherwise records the
    /// deletion in `transaction`, applied when it commits.
    fn expire(&self, transaction: &mut dyn Transaction) -> std::result::Result<bool, StoreError> {
        let Some(store) = self.store.upgrade() else {
            return Ok(false);
        };
        if self.expiry_time > Utc::now().timestamp_millis() {
            return Ok(false);
        }
        store
            .pending
            .entry(transaction.id())
            .or_default()
            .push(self.id);
        Ok(true)
    }
}

/// Local transaction of a `MemoryStore`
struct MemoryTransaction {
    id: u64,
    store: Arc<StoreInner>,
}

impl Transaction for MemoryTransaction {
    fn id(&self) -> u64 {
        self.id
    }

    fn commit(self: Box<Self>) -> std::result::Result<(), StoreError> {
        let deleted = self
            .store
            .pending
            .remove(&self.id)
            .map(|(_, ids)| ids)
            .unwrap_or_default();
        for id in &deleted {
            self.store.records.remove(id);
            self.store.resident.remove(id);
        }
        debug!(transaction = self.id, deleted = deleted.len(), "transaction committed");
        Ok(())
    }

    fn rollback(self: Box<Self>) -> std::result::Result<(), StoreError> {
        self.store.pending.remove(&self.id);
        Ok(())
    }
}

/// Link of one stream of a `MemoryStore`
struct StreamLink {
    stream: StreamId,
    store: Arc<StoreInner>,
}

impl Link for StreamLink {
    fn load_owned_links(&self) -> std::result::Result<bool, StoreError> {
        let owned: Vec<(i64, Record)> = self
            .store
            .records
            .iter()
            .filter(|r| r.value().stream == self.stream)
            .map(|r| (*r.key(), r.value().clone()))
            .collect();

        let mut loaded = 0;
        for (id, record) in owned {
            let (item, created) = self.store.rehydrate(id, &record);
            if created {
                self.store
                    .register_with_expirer(&item)
                    .map_err(|err| StoreError::Severe(err.to_string()))?;
                loaded += 1;
            }
        }
        debug!(stream = %self.stream, loaded, "stream reloaded");
        Ok(loaded > 0)
    }
}

/// In-memory message store
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                next_item_id: AtomicI64::new(1),
                next_transaction_id: AtomicU64::new(1),
                records: DashMap::new(),
                resident: DashMap::new(),
                pending: DashMap::new(),
                expirer: RwLock::new(None),
            }),
        }
    }

    /// Items registered from now on are tracked by `expirer`
    pub fn attach_expirer(&self, expirer: Expirer) {
        *self.inner.expirer.write() = Some(expirer);
    }

    /// Add an item to `stream`. `expiry_time` is unix millis, 0 for never.
    pub fn put(&self, stream: StreamId, payload: Bytes, expiry_time: i64) -> Result<i64> {
        let id = self.inner.next_item_id.fetch_add(1, Ordering::SeqCst);
        let record = Record {
            stream,
            expiry_time,
            payload,
        };
        self.inner.records.insert(id, record.clone());
        let (item, _) = self.inner.rehydrate(id, &record);
        self.inner.register_with_expirer(&item)?;
        Ok(id)
    }

    /// Delete an item. Returns whether it existed.
    pub fn remove(&self, id: i64) -> bool {
        if let Some((_, item)) = self.inner.resident.remove(&id) {
            self.inner.deregister_from_expirer(&item);
        }
        self.inner.records.remove(&id).is_some()
    }

    /// Get the payload of a stored item
    pub fn get(&self, id: i64) -> Option<Bytes> {
        self.inner.records.get(&id).map(|r| r.payload.clone())
    }

    /// The resident copy of an item, if loaded
    pub fn item(&self, id: i64) -> Option<Arc<MemoryItem>> {
        self.inner.resident.get(&id).map(|r| r.value().clone())
    }

    /// Drop the resident copy of an item, keeping its durable record
    pub fn release(&self, id: i64) -> bool {
        self.inner.resident.remove(&id).is_some()
    }

    /// Drop every resident item and detach the expirer, as if the process
    /// had restarted. Only durable records survive.
    pub fn simulate_restart(&self) {
        let dropped = self.inner.resident.len();
        self.inner.expirer.write().take();
        self.inner.resident.clear();
        self.inner.pending.clear();
        info!(dropped, "store restarted, resident items discarded");
    }

    /// Number of stored items
    pub fn len(&self) -> usize {
        self.inner.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.is_empty()
    }

    /// Number of items currently in memory
    pub fn resident_len(&self) -> usize {
        self.inner.resident.len()
    }
}

impl TransactionFactory for MemoryStore {
    fn begin_local_transaction(&self) -> std::result::Result<Box<dyn Transaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            id: self.inner.next_transaction_id.fetch_add(1, Ordering::SeqCst),
            store: self.inner.clone(),
        }))
    }
}

impl Persistence for MemoryStore {
    fn identify_streams_with_expirable_items(
        &self,
    ) -> std::result::Result<HashSet<StreamId>, StoreError> {
        Ok(self
            .inner
            .records
            .iter()
            .filter(|r| r.value().expiry_time != 0)
            .map(|r| r.value().stream)
            .collect())
    }
}

impl LinkRegistry for MemoryStore {
    fn get_link(&self, stream: StreamId) -> Option<Arc<dyn Link>> {
        let exists = self.inner.records.iter().any(|r| r.value().stream == stream);
        exists.then(|| {
            Arc::new(StreamLink {
                stream,
                store: self.inner.clone(),
            }) as Arc<dyn Link>
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    #[test]
    fn test_put_get_remove() {
        let store = MemoryStore::new();
        let id = store.put(StreamId(1), Bytes::from_static(b"hello"), 0).unwrap();
        assert_eq!(store.get(id), Some(Bytes::from_static(b"hello")));
        assert!(store.item(id).unwrap().is_in_store());
        assert!(store.remove(id));
        assert!(!store.remove(id));
        assert!(store.is_empty());
    }

    #[test]
    fn test_expire_applies_on_commit_only() {
        let store = MemoryStore::new();
        let due = store.put(StreamId(1), Bytes::from_static(b"a"), now() - 10).unwrap();
        let item = store.item(due).unwrap();

        let mut tx = store.begin_local_transaction().unwrap();
        assert!(item.expire(tx.as_mut()).unwrap());
        tx.rollback().unwrap();
        assert!(item.is_in_store());

        let mut tx = store.begin_local_transaction().unwrap();
        assert!(item.expire(tx.as_mut()).unwrap());
        assert!(item.is_in_store());
        tx.commit().unwrap();
        assert!(!item.is_in_store());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_not_yet_due_declines() {
        let store = MemoryStore::new();
        let id = store.put(StreamId(1), Bytes::new(), now() + 60_000).unwrap();
        let mut tx = store.begin_local_transaction().unwrap();
        assert!(!store.item(id).unwrap().expire(tx.as_mut()).unwrap());
    }

    #[test]
    fn test_streams_with_expirable_items() {
        let store = MemoryStore::new();
        store.put(StreamId(1), Bytes::new(), 0).unwrap();
        store.put(StreamId(2), Bytes::new(), now() + 1000).unwrap();
        store.put(StreamId(3), Bytes::new(), now() + 1000).unwrap();
        store.put(StreamId(3), Bytes::new(), 0).unwrap();

        let streams = store.identify_streams_with_expirable_items().unwrap();
        let mut streams: Vec<_> = streams.into_iter().collect();
        streams.sort();
        assert_eq!(streams, vec![StreamId(2), StreamId(3)]);
    }

    #[test]
    fn test_restart_and_reload() {
        let store = MemoryStore::new();
        let a = store.put(StreamId(4), Bytes::from_static(b"a"), 0).unwrap();
        let b = store.put(StreamId(4), Bytes::from_static(b"b"), 0).unwrap();
        store.simulate_restart();
        assert_eq!(store.resident_len(), 0);
        assert_eq!(store.len(), 2);

        let link = store.get_link(StreamId(4)).unwrap();
        assert!(link.load_owned_links().unwrap());
        assert!(store.item(a).is_some() && store.item(b).is_some());
        // already resident
        assert!(!link.load_owned_links().unwrap());
        assert!(store.get_link(StreamId(5)).is_none());
    }

    #[test]
    fn test_release_leaves_record() {
        let store = MemoryStore::new();
        let id = store.put(StreamId(1), Bytes::from_static(b"x"), 0).unwrap();
        let weak = Arc::downgrade(&store.item(id).unwrap());
        assert!(store.release(id));
        assert!(weak.upgrade().is_none());
        assert_eq!(store.get(id), Some(Bytes::from_static(b"x")));
    }
}
