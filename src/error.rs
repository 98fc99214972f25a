//! Error Types
//!
//! Failures raised by store collaborators and by the expiry daemons.

use thiserror::Error;

/// Failure reported by a store collaborator (transactions, persistence, links).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The persistence layer could not answer a query
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// A local transaction could not begin, commit or roll back
    #[error("transaction failure: {0}")]
    Transaction(String),

    /// An unrecoverable inconsistency inside the store
    #[error("severe store error: {0}")]
    Severe(String),

    /// The operation was interrupted, typically by a shutdown
    #[error("operation interrupted")]
    Interrupted,
}

/// Errors raised by the expiry subsystem
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExpiryError {
    /// Item has no unique id, so it does not belong to a trackable stream
    #[error("expirable item has no unique id")]
    NoUniqueId,

    /// `start` called on a daemon that is already running
    #[error("{0} already running")]
    AlreadyRunning(&'static str),

    /// The same (expiry time, id) pair was registered twice
    #[error("duplicate expirable: expiry_time={expiry_time} id={id}")]
    DuplicateExpirable { expiry_time: i64, id: i64 },

    /// Too many consecutive sweep failures
    #[error("expiry daemon terminated: {0}")]
    ExpiryDaemonTerminated(#[source] StoreError),

    /// Restart recovery could not continue
    #[error("cache loader terminated: {0}")]
    CacheLoaderTerminated(#[source] StoreError),

    /// A configuration property could not be parsed
    #[error("invalid value {value:?} for property {key}")]
    Config { key: String, value: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ExpiryError>;
