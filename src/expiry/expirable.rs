//! Expirable items and their index references

use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::error::{ExpiryError, Result, StoreError};
use crate::storage::Transaction;

/// Id reported by items that are not part of a trackable stream
pub const NO_ID: i64 = 0;

/// A store item that carries a time-to-live
pub trait Expirable: Send + Sync {
    /// Absolute expiry time in unix milliseconds (0 = never)
    fn expiry_time(&self) -> i64;

    /// Unique, non-zero id within the store
    fn id(&self) -> i64;

    /// Whether the item is still part of the store
    fn is_in_store(&self) -> bool;

    /// Delete the item under `transaction`. Returns `false` when the item
    /// declines, in which case it stays indexed for the next cycle.
    fn expire(&self, transaction: &mut dyn Transaction) -> std::result::Result<bool, StoreError>;
}

/// Entry of the expiry index.
///
/// Holds a weak handle to the item, so indexing never keeps an item
/// resident, plus the expiry time and id needed for ordering once the
/// item itself has been reclaimed. Equality and ordering use
/// `(expiry_time, id)` only.
#[derive(Clone)]
pub struct ExpirableReference {
    expiry_time: i64,
    id: i64,
    item: Weak<dyn Expirable>,
    // insertion token handed out by the index, not part of the ordering
    pub(crate) token: u64,
}

impl ExpirableReference {
    /// Wrap `item`. The expiry time starts at 0 and must be set with
    /// [`with_expiry_time`](Self::with_expiry_time) before indexing.
    pub fn new(item: &Arc<dyn Expirable>) -> Result<Self> {
        let id = item.id();
        if id == NO_ID {
            return Err(ExpiryError::NoUniqueId);
        }
        Ok(Self {
            expiry_time: 0,
            id,
            item: Arc::downgrade(item),
            token: 0,
        })
    }

    pub fn with_expiry_time(mut self, expiry_time: i64) -> Self {
        self.expiry_time = expiry_time;
        self
    }

    pub fn expiry_time(&self) -> i64 {
        self.expiry_time
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// The item, if it has not been reclaimed
    pub fn expirable(&self) -> Option<Arc<dyn Expirable>> {
        self.item.upgrade()
    }

    /// Reclaimed, or no longer part of the store
    pub fn is_stale(&self) -> bool {
        match self.expirable() {
            Some(item) => !item.is_in_store(),
            None => true,
        }
    }
}

impl PartialEq for ExpirableReference {
    fn eq(&self, other: &Self) -> bool {
        self.expiry_time == other.expiry_time && self.id == other.id
    }
}

impl Eq for ExpirableReference {}

impl PartialOrd for ExpirableReference {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ExpirableReference {
    fn cmp(&self, other: &Self) -> Ordering {
        self.expiry_time
            .cmp(&other.expiry_time)
            .then(self.id.cmp(&other.id))
    }
}

impl fmt::Debug for ExpirableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpirableReference")
            .field("expiry_time", &self.expiry_time)
            .field("id", &self.id)
            .field("live", &(self.item.strong_count() > 0))
            .finish()
    }
}
