//! Storage Collaborators
//!
//! The narrow store interfaces the expiry subsystem consumes: local
//! transactions, the persisted view of streams, and stream links.
//! `MemoryStore` is an in-memory implementation of all of them.

mod memory;

use hashbrown::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::error::StoreError;

pub use memory::{MemoryItem, MemoryStore};

/// Identifier of a persisted stream of store items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub i64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// A local (single resource) store transaction
pub trait Transaction: Send {
    /// Store-unique transaction id
    fn id(&self) -> u64;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Source of local transactions
pub trait TransactionFactory: Send + Sync {
    fn begin_local_transaction(&self) -> Result<Box<dyn Transaction>, StoreError>;
}

/// Persisted view of the store
pub trait Persistence: Send + Sync {
    /// Every stream that holds at least one item with an expiry time
    fn identify_streams_with_expirable_items(&self) -> Result<HashSet<StreamId>, StoreError>;
}

/// In-memory link object of a stream
pub trait Link: Send + Sync {
    /// Rehydrate the items the stream owns. Rehydrated items with an
    /// expiry time register themselves with the expirer.
    fn load_owned_links(&self) -> Result<bool, StoreError>;
}

/// Lookup of stream links by id
pub trait LinkRegistry: Send + Sync {
    /// `None` when the stream is already gone
    fn get_link(&self, stream: StreamId) -> Option<Arc<dyn Link>>;
}
