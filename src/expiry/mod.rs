//! Expiry Subsystem
//!
//! Tracks store items that carry a time-to-live, removes them once their
//! time has passed, and rebuilds that tracking after a restart.

mod alarm;
mod cache_loader;
pub(crate) mod expirable;
mod expirer;
mod index;

pub use alarm::{Alarm, AlarmId, AlarmScheduler};
pub use cache_loader::{CacheLoader, LoaderCycle};
pub use expirable::{Expirable, ExpirableReference, NO_ID};
pub use expirer::{
    CleanupCadence, Expirer, ExpiryCycle, BATCH_SIZE, CLEANUP_EVERY_N_CYCLES,
    MAX_CLEANUP_CYCLES, MAX_CONSECUTIVE_FAILURES,
};
pub use index::ExpiryIndex;
