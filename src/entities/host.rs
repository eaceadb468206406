//! Host accessor interface.
//!
//! The authoring application's scene graph is never owned here. Objects, bones
//! and data-blocks are addressed through small `Copy` handles that may go stale
//! between passes, so every lookup answers "resolved or not found" instead of
//! trusting liveness.
//!
//! Implementations live outside the sync core (see [`MemoryScene`] for the
//! in-process one used by the CLI and tests).
//!
//! [`MemoryScene`]: super::memory_scene::MemoryScene

use std::fmt;

use glam::Mat4;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Non-owning handle to a host object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

/// Non-owning handle to a skeletal sub-element of an armature object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BoneId(pub u64);

/// Identity of a host data-block (mesh, curve, ...) that objects point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OB#{}", self.0)
    }
}

/// Geometry kind of a host object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ObjectKind {
    Mesh,
    Curve,
    Armature,
    Camera,
    Light,
    #[default]
    Empty,
}

/// Kind of a modifier entry on an object's modifier stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ModifierKind {
    /// Node-based procedural geometry modifier (the only kind with exported inputs)
    GeometryProcedural,
    #[default]
    Other,
}

/// Modifier stack entry as seen from the sync core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifierDesc {
    pub name: String,
    #[serde(default)]
    pub kind: ModifierKind,
}

/// Raw host-side parameter value.
///
/// Mirrors what the host stores, not what crosses the boundary: `Double`,
/// `Bool` and `Group` have no boundary representation and are skipped on export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HostValue {
    Int(i32),
    Float(f32),
    IntArray(Vec<i32>),
    FloatArray(Vec<f32>),
    String(String),
    Double(f64),
    Bool(bool),
    Group,
}

impl HostValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Int(_) => "Int",
            HostValue::Float(_) => "Float",
            HostValue::IntArray(_) => "IntArray",
            HostValue::FloatArray(_) => "FloatArray",
            HostValue::String(_) => "String",
            HostValue::Double(_) => "Double",
            HostValue::Bool(_) => "Bool",
            HostValue::Group => "Group",
        }
    }

    /// Truthiness used for `<id>_use_attribute` companion entries.
    pub fn is_truthy(&self) -> bool {
        match self {
            HostValue::Int(v) => *v != 0,
            HostValue::Bool(v) => *v,
            HostValue::Float(v) => *v != 0.0,
            HostValue::Double(v) => *v != 0.0,
            _ => false,
        }
    }
}

/// One entry of a procedural modifier's input group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostParameter {
    /// Socket identifier, e.g. `Input_2` (the exported `propertyName`)
    pub identifier: String,
    pub value: HostValue,
}

/// Declared numeric range, as stored by the host (always double precision).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn unbounded() -> Self {
        Self::new(f64::MIN, f64::MAX)
    }
}

/// Declared input socket of a procedural node group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketDesc {
    pub identifier: String,
    /// Display name shown in the host UI
    pub name: String,
    pub bounds: Bounds,
}

/// User-attached parameter on an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomParameter {
    pub name: String,
    pub value: HostValue,
    /// UI metadata; parameters without it are not exported.
    #[serde(default)]
    pub ui: Option<UiHints>,
}

/// UI metadata attached to a custom parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UiHints {
    /// Numeric soft range. `None` for string parameters.
    #[serde(default)]
    pub bounds: Option<Bounds>,
    #[serde(default)]
    pub description: String,
}

/// Address of a writable parameter slot on an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParameterSlot {
    Procedural { modifier: String, identifier: String },
    Custom { name: String },
}

/// One entry of the evaluated dependency graph's object-instance collection.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatedInstance {
    /// Object the entry refers to; `None` when the host reports a null object
    pub object: Option<ObjectId>,
    /// True for generated duplicates, false for direct scene objects
    pub is_instance: bool,
    pub kind: ObjectKind,
    /// Data-block the instanced geometry comes from
    pub data: Option<DataId>,
    /// Host-space world matrix of the instance
    pub world: Mat4,
}

/// Scoped iteration over evaluated instances.
///
/// The host releases its iteration handle when the iterator is dropped, which
/// covers normal completion, early `break`/`continue` and unwinding alike.
pub type InstanceScope<'a> = Box<dyn Iterator<Item = EvaluatedInstance> + 'a>;

/// Failures reported by a host accessor.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HostError {
    #[error("object {0} not found")]
    ObjectNotFound(ObjectId),
    #[error("parameter {slot} not found on {object}")]
    ParameterNotFound { object: ObjectId, slot: String },
    #[error("type mismatch on {slot}: host stores {expected}, got {found}")]
    TypeMismatch {
        slot: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("length mismatch on {slot}: host stores {expected} elements, got {found}")]
    LengthMismatch { slot: String, expected: usize, found: usize },
    #[error("instance iteration unavailable: {0}")]
    IterationUnavailable(String),
}

impl fmt::Display for ParameterSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterSlot::Procedural { modifier, identifier } => write!(f, "{}[{}]", modifier, identifier),
            ParameterSlot::Custom { name } => write!(f, "[\"{}\"]", name),
        }
    }
}

/// Accessor capability over the host scene graph.
///
/// All methods take `&self`: hosts guard their own storage, and the sync core
/// calls in from worker threads during the touch phase.
pub trait HostScene: Send + Sync {
    /// Hierarchy path of an object, e.g. `/Rig/Arm`. `None` if it no longer exists.
    fn object_path(&self, object: ObjectId) -> Option<String>;

    /// Display name assigned by the host.
    fn object_name(&self, object: ObjectId) -> Option<String>;

    /// Reverse lookup of [`object_path`](Self::object_path).
    fn object_by_path(&self, path: &str) -> Option<ObjectId>;

    /// Direct children of an object.
    fn children(&self, object: ObjectId) -> Vec<ObjectId>;

    /// Objects without a parent, in host order.
    fn root_objects(&self) -> Vec<ObjectId>;

    /// Every object in the scene, in host order.
    fn scene_objects(&self) -> Vec<ObjectId>;

    fn object_kind(&self, object: ObjectId) -> Option<ObjectKind>;

    /// Data-block the object points at, if any.
    fn object_data(&self, object: ObjectId) -> Option<DataId>;

    /// Bones of an armature object (empty for other kinds).
    fn bones(&self, object: ObjectId) -> Vec<BoneId>;

    /// Path of a bone under its armature, e.g. `/Rig/Hip/Spine`.
    fn bone_path(&self, object: ObjectId, bone: BoneId) -> Option<String>;

    fn modifiers(&self, object: ObjectId) -> Vec<ModifierDesc>;

    /// Raw input group of a procedural modifier, companion entries included.
    fn procedural_inputs(&self, object: ObjectId, modifier: &str) -> Vec<HostParameter>;

    /// Declared socket for a procedural input.
    fn procedural_socket(&self, object: ObjectId, modifier: &str, identifier: &str) -> Option<SocketDesc>;

    fn custom_parameters(&self, object: ObjectId) -> Vec<CustomParameter>;

    /// Write a value into a parameter slot.
    fn apply_value(&self, object: ObjectId, slot: &ParameterSlot, value: HostValue) -> Result<(), HostError>;

    /// Tag the object so the host re-evaluates it on its next update.
    fn mark_needs_recompute(&self, object: ObjectId);

    /// Open a scoped iteration over the evaluated instance collection.
    fn evaluated_instances(&self) -> Result<InstanceScope<'_>, HostError>;
}
