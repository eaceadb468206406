//! Entities module - data crossing the sync boundary and the capabilities on either side.
//!
//! - `host`: accessor trait over the authoring application's scene graph
//! - `destination`: owned destination-side transform handles
//! - `property`: typed parameter snapshots (`PropertyInfo`)
//! - `transform`: host-to-destination coordinate conversion
//! - `memory_scene`: in-process host used by the CLI and tests

pub mod destination;
pub mod host;
pub mod memory_scene;
pub mod property;
pub mod transform;

pub use destination::{DestinationId, DestinationScene, RecordingDestination, TransformHandle};
pub use host::{BoneId, DataId, HostError, HostScene, HostValue, ObjectId, ObjectKind, ParameterSlot};
pub use memory_scene::{MemoryScene, SceneDesc};
pub use property::{PropertyBatch, PropertyInfo, PropertyType, PropertyValue, SourceType};
