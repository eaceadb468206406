//! Core sync engine - records, properties, instances, tasks
//!
//! These modules form the reconciliation engine, independent of any concrete host.

pub mod error;
pub mod instances;
pub mod properties;
pub mod records;
pub mod session;
pub mod tasks;
pub mod workers;

// Re-exports for convenience
pub use error::SyncError;
pub use instances::{GroupedInstances, collect_instances, enumerate_grouped, enumerate_instances};
pub use properties::{ImportReport, PropertySync};
pub use records::{ObjectRecord, RecordRef, RecordTracker, SweepStats};
pub use session::{PassReport, SyncSession};
pub use tasks::{TaskController, TaskError, TaskKind};
pub use workers::Workers;
