//! In-process [`HostScene`] backed by a JSON scene description.
//!
//! Used by the CLI to replay scenes and by tests to script host mutations
//! between passes (rename, delete, re-parent, parameter edits).
//!
//! Paths follow the host convention: `/Parent/Child` for objects and
//! `/Armature/Bone/Child` for bones.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use glam::Mat4;
use log::trace;
use serde::{Deserialize, Serialize};

use super::host::{
    BoneId, CustomParameter, DataId, EvaluatedInstance, HostError, HostParameter, HostScene, HostValue,
    InstanceScope, ModifierDesc, ModifierKind, ObjectId, ObjectKind, ParameterSlot, SocketDesc,
};

fn identity_cols() -> [f32; 16] {
    Mat4::IDENTITY.to_cols_array()
}

/// Serialized scene: objects plus the evaluated instance collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SceneDesc {
    #[serde(default)]
    pub objects: Vec<ObjectDesc>,
    #[serde(default)]
    pub instances: Vec<InstanceDesc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectDesc {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub parent: Option<u64>,
    #[serde(default)]
    pub kind: ObjectKind,
    #[serde(default)]
    pub data: Option<u64>,
    #[serde(default)]
    pub bones: Vec<BoneDesc>,
    #[serde(default)]
    pub modifiers: Vec<ModifierEntry>,
    #[serde(default)]
    pub custom: Vec<CustomParameter>,
}

impl ObjectDesc {
    pub fn new(id: u64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            parent: None,
            kind: ObjectKind::Empty,
            data: None,
            bones: Vec::new(),
            modifiers: Vec::new(),
            custom: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoneDesc {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub parent: Option<u64>,
}

/// Modifier stack entry with its input group and declared sockets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifierEntry {
    pub name: String,
    #[serde(default)]
    pub kind: ModifierKind,
    #[serde(default)]
    pub inputs: Vec<HostParameter>,
    #[serde(default)]
    pub sockets: Vec<SocketDesc>,
}

/// Evaluated instance entry; `world` is a column-major 4x4 matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDesc {
    #[serde(default)]
    pub object: Option<u64>,
    #[serde(default)]
    pub is_instance: bool,
    #[serde(default)]
    pub kind: ObjectKind,
    #[serde(default)]
    pub data: Option<u64>,
    #[serde(default = "identity_cols")]
    pub world: [f32; 16],
}

/// Iterator handed out by [`MemoryScene::evaluated_instances`].
struct ScopedInstances {
    items: std::vec::IntoIter<EvaluatedInstance>,
    released: Arc<AtomicUsize>,
}

impl Iterator for ScopedInstances {
    type Item = EvaluatedInstance;

    fn next(&mut self) -> Option<Self::Item> {
        self.items.next()
    }
}

impl Drop for ScopedInstances {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
        trace!("memory scene: instance iteration released");
    }
}

/// In-memory host scene.
#[derive(Debug, Default)]
pub struct MemoryScene {
    state: RwLock<SceneDesc>,
    recompute: Mutex<HashMap<ObjectId, usize>>,
    iterations_opened: AtomicUsize,
    iterations_released: Arc<AtomicUsize>,
    fail_iteration: AtomicBool,
}

impl MemoryScene {
    pub fn new(desc: SceneDesc) -> Self {
        Self {
            state: RwLock::new(desc),
            ..Default::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let desc: SceneDesc = serde_json::from_str(json).context("Parse scene error")?;
        Ok(Self::new(desc))
    }

    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read scene: {}", path.display()))?;
        Self::from_json_str(&json)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SceneDesc> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SceneDesc> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    // ========== Scripted host mutations ==========

    pub fn add_object(&self, desc: ObjectDesc) {
        self.write().objects.push(desc);
    }

    /// Rename an object. Returns false if it does not exist.
    pub fn rename_object(&self, object: ObjectId, name: &str) -> bool {
        let mut state = self.write();
        match state.objects.iter_mut().find(|o| o.id == object.0) {
            Some(o) => {
                o.name = name.to_string();
                true
            }
            None => false,
        }
    }

    /// Delete an object; its children become roots.
    pub fn remove_object(&self, object: ObjectId) -> bool {
        let mut state = self.write();
        let before = state.objects.len();
        state.objects.retain(|o| o.id != object.0);
        for o in state.objects.iter_mut() {
            if o.parent == Some(object.0) {
                o.parent = None;
            }
        }
        state.objects.len() != before
    }

    pub fn set_parent(&self, object: ObjectId, parent: Option<ObjectId>) -> bool {
        let mut state = self.write();
        match state.objects.iter_mut().find(|o| o.id == object.0) {
            Some(o) => {
                o.parent = parent.map(|p| p.0);
                true
            }
            None => false,
        }
    }

    pub fn set_instances(&self, instances: Vec<InstanceDesc>) {
        self.write().instances = instances;
    }

    /// Current value of a procedural input.
    pub fn procedural_value(&self, object: ObjectId, modifier: &str, identifier: &str) -> Option<HostValue> {
        let state = self.read();
        let obj = state.objects.iter().find(|o| o.id == object.0)?;
        let m = obj.modifiers.iter().find(|m| m.name == modifier)?;
        m.inputs.iter().find(|p| p.identifier == identifier).map(|p| p.value.clone())
    }

    /// Current value of a custom parameter.
    pub fn custom_value(&self, object: ObjectId, name: &str) -> Option<HostValue> {
        let state = self.read();
        let obj = state.objects.iter().find(|o| o.id == object.0)?;
        obj.custom.iter().find(|c| c.name == name).map(|c| c.value.clone())
    }

    /// Number of recompute tags received by an object.
    pub fn recompute_count(&self, object: ObjectId) -> usize {
        self.recompute
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&object)
            .copied()
            .unwrap_or(0)
    }

    /// Make the next instance iterations fail to open.
    pub fn set_iteration_failure(&self, fail: bool) {
        self.fail_iteration.store(fail, Ordering::SeqCst);
    }

    /// (opened, released) counts of instance iterations.
    pub fn iteration_counts(&self) -> (usize, usize) {
        (
            self.iterations_opened.load(Ordering::SeqCst),
            self.iterations_released.load(Ordering::SeqCst),
        )
    }

    // ========== Internals ==========

    fn path_of(state: &SceneDesc, id: u64) -> Option<String> {
        let mut names = Vec::new();
        let mut current = state.objects.iter().find(|o| o.id == id)?;
        // Depth bound keeps a malformed (cyclic) description from looping forever
        for _ in 0..=state.objects.len() {
            names.push(current.name.as_str());
            match current.parent.and_then(|p| state.objects.iter().find(|o| o.id == p)) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        names.reverse();
        Some(names.iter().fold(String::new(), |mut acc, n| {
            acc.push('/');
            acc.push_str(n);
            acc
        }))
    }

    fn bone_chain(bones: &[BoneDesc], id: u64) -> Option<String> {
        let mut names = Vec::new();
        let mut current = bones.iter().find(|b| b.id == id)?;
        for _ in 0..=bones.len() {
            names.push(current.name.as_str());
            match current.parent.and_then(|p| bones.iter().find(|b| b.id == p)) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        names.reverse();
        Some(names.join("/"))
    }
}

// Vector parameters have a fixed arity on the host side
fn check_len(slot: &ParameterSlot, expected: usize, found: usize) -> Result<(), HostError> {
    if expected != found {
        return Err(HostError::LengthMismatch {
            slot: slot.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

fn assign(slot: &ParameterSlot, stored: &mut HostValue, value: HostValue) -> Result<(), HostError> {
    match (stored, value) {
        (HostValue::Int(dst), HostValue::Int(v)) => *dst = v,
        (HostValue::Float(dst), HostValue::Float(v)) => *dst = v,
        (HostValue::IntArray(dst), HostValue::IntArray(src)) => {
            check_len(slot, dst.len(), src.len())?;
            dst.copy_from_slice(&src);
        }
        (HostValue::FloatArray(dst), HostValue::FloatArray(src)) => {
            check_len(slot, dst.len(), src.len())?;
            dst.copy_from_slice(&src);
        }
        (HostValue::String(dst), HostValue::String(v)) => *dst = v,
        (stored, value) => {
            return Err(HostError::TypeMismatch {
                slot: slot.to_string(),
                expected: stored.type_name(),
                found: value.type_name(),
            });
        }
    }
    Ok(())
}

impl HostScene for MemoryScene {
    fn object_path(&self, object: ObjectId) -> Option<String> {
        Self::path_of(&self.read(), object.0)
    }

    fn object_name(&self, object: ObjectId) -> Option<String> {
        self.read()
            .objects
            .iter()
            .find(|o| o.id == object.0)
            .map(|o| o.name.clone())
    }

    fn object_by_path(&self, path: &str) -> Option<ObjectId> {
        let state = self.read();
        state
            .objects
            .iter()
            .find(|o| Self::path_of(&state, o.id).as_deref() == Some(path))
            .map(|o| ObjectId(o.id))
    }

    fn children(&self, object: ObjectId) -> Vec<ObjectId> {
        self.read()
            .objects
            .iter()
            .filter(|o| o.parent == Some(object.0))
            .map(|o| ObjectId(o.id))
            .collect()
    }

    fn root_objects(&self) -> Vec<ObjectId> {
        let state = self.read();
        state
            .objects
            .iter()
            .filter(|o| o.parent.is_none_or(|p| !state.objects.iter().any(|x| x.id == p)))
            .map(|o| ObjectId(o.id))
            .collect()
    }

    fn scene_objects(&self) -> Vec<ObjectId> {
        self.read().objects.iter().map(|o| ObjectId(o.id)).collect()
    }

    fn object_kind(&self, object: ObjectId) -> Option<ObjectKind> {
        self.read().objects.iter().find(|o| o.id == object.0).map(|o| o.kind)
    }

    fn object_data(&self, object: ObjectId) -> Option<DataId> {
        self.read()
            .objects
            .iter()
            .find(|o| o.id == object.0)
            .and_then(|o| o.data)
            .map(DataId)
    }

    fn bones(&self, object: ObjectId) -> Vec<BoneId> {
        self.read()
            .objects
            .iter()
            .find(|o| o.id == object.0 && o.kind == ObjectKind::Armature)
            .map(|o| o.bones.iter().map(|b| BoneId(b.id)).collect())
            .unwrap_or_default()
    }

    fn bone_path(&self, object: ObjectId, bone: BoneId) -> Option<String> {
        let state = self.read();
        let base = Self::path_of(&state, object.0)?;
        let obj = state.objects.iter().find(|o| o.id == object.0)?;
        let chain = Self::bone_chain(&obj.bones, bone.0)?;
        Some(format!("{}/{}", base, chain))
    }

    fn modifiers(&self, object: ObjectId) -> Vec<ModifierDesc> {
        self.read()
            .objects
            .iter()
            .find(|o| o.id == object.0)
            .map(|o| {
                o.modifiers
                    .iter()
                    .map(|m| ModifierDesc { name: m.name.clone(), kind: m.kind })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn procedural_inputs(&self, object: ObjectId, modifier: &str) -> Vec<HostParameter> {
        self.read()
            .objects
            .iter()
            .find(|o| o.id == object.0)
            .and_then(|o| o.modifiers.iter().find(|m| m.name == modifier))
            .map(|m| m.inputs.clone())
            .unwrap_or_default()
    }

    fn procedural_socket(&self, object: ObjectId, modifier: &str, identifier: &str) -> Option<SocketDesc> {
        let state = self.read();
        let obj = state.objects.iter().find(|o| o.id == object.0)?;
        let m = obj.modifiers.iter().find(|m| m.name == modifier)?;
        m.sockets.iter().find(|s| s.identifier == identifier).cloned()
    }

    fn custom_parameters(&self, object: ObjectId) -> Vec<CustomParameter> {
        self.read()
            .objects
            .iter()
            .find(|o| o.id == object.0)
            .map(|o| o.custom.clone())
            .unwrap_or_default()
    }

    fn apply_value(&self, object: ObjectId, slot: &ParameterSlot, value: HostValue) -> Result<(), HostError> {
        let mut state = self.write();
        let obj = state
            .objects
            .iter_mut()
            .find(|o| o.id == object.0)
            .ok_or(HostError::ObjectNotFound(object))?;

        let not_found = || HostError::ParameterNotFound { object, slot: slot.to_string() };
        let stored = match slot {
            ParameterSlot::Procedural { modifier, identifier } => obj
                .modifiers
                .iter_mut()
                .find(|m| &m.name == modifier)
                .and_then(|m| m.inputs.iter_mut().find(|p| &p.identifier == identifier))
                .map(|p| &mut p.value)
                .ok_or_else(not_found)?,
            ParameterSlot::Custom { name } => obj
                .custom
                .iter_mut()
                .find(|c| &c.name == name)
                .map(|c| &mut c.value)
                .ok_or_else(not_found)?,
        };
        assign(slot, stored, value)
    }

    fn mark_needs_recompute(&self, object: ObjectId) {
        *self
            .recompute
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(object)
            .or_default() += 1;
    }

    fn evaluated_instances(&self) -> Result<InstanceScope<'_>, HostError> {
        if self.fail_iteration.load(Ordering::SeqCst) {
            return Err(HostError::IterationUnavailable("depsgraph not evaluated".into()));
        }

        let items: Vec<EvaluatedInstance> = self
            .read()
            .instances
            .iter()
            .map(|i| EvaluatedInstance {
                object: i.object.map(ObjectId),
                is_instance: i.is_instance,
                kind: i.kind,
                data: i.data.map(DataId),
                world: Mat4::from_cols_array(&i.world),
            })
            .collect();

        self.iterations_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScopedInstances {
            items: items.into_iter(),
            released: Arc::clone(&self.iterations_released),
        }))
    }
}
