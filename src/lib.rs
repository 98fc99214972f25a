//! LAPSE - Expiry subsystem of an embedded message store
//!
//! Tracks store items that carry a time-to-live in a time-ordered index,
//! expires them from a timer-driven daemon under batched transactions,
//! and rebuilds the index after a restart by lazily reloading the streams
//! that hold expirable items.

pub mod config;
pub mod error;
pub mod expiry;
pub mod observability;
pub mod service;
pub mod storage;

pub use config::Properties;
pub use error::{ExpiryError, Result, StoreError};
pub use expiry::{
    AlarmScheduler, CacheLoader, Expirable, ExpirableReference, Expirer, ExpiryIndex,
};
pub use observability::DumpNode;
pub use service::ExpiryService;
pub use storage::{MemoryStore, StreamId};
