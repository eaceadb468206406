//! SCENELINK - Live scene reconciliation and typed property sync
//!
//! Re-exports all modules for use by the binary target.

// Core engine (records, properties, instances, tasks)
pub mod core;

// App modules
pub mod cli;
pub mod config;
pub mod entities;

// Re-export commonly used types from core
pub use core::session::{PassReport, SyncSession};
pub use core::{SyncError, TaskController, TaskKind};

// Re-export entities
pub use entities::{HostScene, MemoryScene, ObjectId, PropertyBatch, PropertyInfo, RecordingDestination};
