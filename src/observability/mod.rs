//! Observability Module
//!
//! Per-cycle history and the diagnostic dump both daemons expose.

mod dump;
mod history;

pub use dump::{DaemonDiagnostics, DumpNode};
pub use history::CycleHistory;
