//! Errors that abort a sync pass.
//!
//! Expected absences (an object deleted mid-pass, an unresolved import path)
//! never show up here: they are skipped where they occur.

use thiserror::Error;

use super::tasks::TaskError;
use crate::entities::host::HostError;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A parallel or deferred task failed; the pass left records untouched.
    #[error(transparent)]
    Task(#[from] TaskError),
    /// The host refused to open its instance iteration.
    #[error("instance enumeration failed: {0}")]
    Host(#[from] HostError),
    /// The worker pool could not be started.
    #[error("worker pool: {0}")]
    Pool(#[from] std::io::Error),
}
