//! Typed property export/import.
//!
//! [`PropertySync`] is the only way parameter values cross the boundary. It
//! owns a single session-wide lock: exports and imports never interleave, and
//! within one direction batches are processed one at a time.
//!
//! Export walks two sources on an object:
//! - procedural modifier inputs (with bounds from the declared socket)
//! - custom parameters carrying UI metadata (strings allowed)
//!
//! Import resolves each entry by path, skips what no longer resolves, writes
//! the value back and tags every touched object for recompute once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexSet;
use log::{debug, trace, warn};

use crate::entities::host::{HostParameter, HostScene, ModifierKind, ObjectId, ParameterSlot};
use crate::entities::property::{PropertyBatch, PropertyInfo, PropertyValue, SourceType};

use super::records::{RecordTracker, lock_record};

const USE_ATTRIBUTE_SUFFIX: &str = "_use_attribute";
const ATTRIBUTE_NAME_SUFFIX: &str = "_attribute_name";

/// Outcome of one import call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub applied: usize,
    pub skipped: usize,
    /// Objects tagged for recompute, in first-applied order
    pub recomputed: Vec<ObjectId>,
}

/// Lock-guarded state: last exported content hash per record path.
#[derive(Debug, Default)]
struct ExportState {
    last_hash: HashMap<String, u64>,
}

/// Procedural/custom parameter sync engine.
#[derive(Debug)]
pub struct PropertySync {
    tracker: Arc<RecordTracker>,
    state: Mutex<ExportState>,
}

fn is_companion(identifier: &str) -> bool {
    identifier.ends_with(USE_ATTRIBUTE_SUFFIX) || identifier.ends_with(ATTRIBUTE_NAME_SUFFIX)
}

/// True when `<identifier>_use_attribute` exists and is set.
fn driven_by_attribute(inputs: &[HostParameter], identifier: &str) -> bool {
    let flag = format!("{}{}", identifier, USE_ATTRIBUTE_SUFFIX);
    inputs
        .iter()
        .any(|p| p.identifier == flag && p.value.is_truthy())
}

impl PropertySync {
    pub fn new(tracker: Arc<RecordTracker>) -> Self {
        Self {
            tracker,
            state: Mutex::new(ExportState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ExportState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot every exportable parameter of `object`.
    ///
    /// An object that no longer resolves yields an empty batch.
    pub fn export_properties(&self, host: &dyn HostScene, object: ObjectId) -> PropertyBatch {
        let _guard = self.lock();
        self.collect(host, object)
    }

    /// Like [`export_properties`](Self::export_properties) but returns an empty
    /// batch when nothing changed since the last export of the same path.
    pub fn export_changed(&self, host: &dyn HostScene, object: ObjectId) -> PropertyBatch {
        let mut state = self.lock();
        let batch = self.collect(host, object);
        let Some(path) = batch.iter().next().map(|p| p.path.clone()) else {
            return batch;
        };

        let hash = batch.content_hash();
        if state.last_hash.get(&path) == Some(&hash) {
            trace!("export: {} unchanged", path);
            return PropertyBatch::new();
        }
        state.last_hash.insert(path, hash);
        batch
    }

    fn collect(&self, host: &dyn HostScene, object: ObjectId) -> PropertyBatch {
        let mut batch = PropertyBatch::new();
        let Some(path) = self.tracker.record_path(host, object) else {
            debug!("export: {} not found, skipped", object);
            return batch;
        };

        for modifier in host.modifiers(object) {
            if modifier.kind != ModifierKind::GeometryProcedural {
                continue;
            }
            let inputs = host.procedural_inputs(object, &modifier.name);
            for input in &inputs {
                if is_companion(&input.identifier) || driven_by_attribute(&inputs, &input.identifier) {
                    continue;
                }
                let Some(socket) = host.procedural_socket(object, &modifier.name, &input.identifier) else {
                    debug!("export: {}[{}] has no socket", modifier.name, input.identifier);
                    continue;
                };
                let Some(value) = PropertyValue::from_host(&input.value, Some(socket.bounds), false) else {
                    debug!(
                        "export: {}[{}] of kind {} skipped",
                        modifier.name,
                        input.identifier,
                        input.value.type_name()
                    );
                    continue;
                };
                batch.push(PropertyInfo {
                    path: path.clone(),
                    name: socket.name,
                    modifier_name: modifier.name.clone(),
                    property_name: input.identifier.clone(),
                    source_type: SourceType::GeometryProcedural,
                    value,
                });
            }
        }

        for custom in host.custom_parameters(object) {
            let Some(ui) = custom.ui else {
                continue;
            };
            let Some(value) = PropertyValue::from_host(&custom.value, ui.bounds, true) else {
                debug!("export: custom {} of kind {} skipped", custom.name, custom.value.type_name());
                continue;
            };
            batch.push(PropertyInfo {
                path: path.clone(),
                name: custom.name.clone(),
                modifier_name: String::new(),
                property_name: custom.name,
                source_type: SourceType::Custom,
                value,
            });
        }

        trace!("export: {} -> {} properties", path, batch.len());
        batch
    }

    fn resolve(&self, host: &dyn HostScene, path: &str) -> Option<ObjectId> {
        self.tracker
            .find_by_path(path)
            .map(|record| lock_record(&record).object)
            .or_else(|| host.object_by_path(path))
    }

    /// Write a batch back onto the host.
    ///
    /// Entries whose path or slot no longer resolves are skipped; the batch as a
    /// whole never fails. Values are applied as given, bounds are not enforced.
    pub fn import_properties(&self, host: &dyn HostScene, batch: &PropertyBatch) -> ImportReport {
        let mut state = self.lock();
        let mut report = ImportReport::default();
        let mut applied: IndexSet<ObjectId> = IndexSet::new();

        for info in batch.iter() {
            let Some(object) = self.resolve(host, &info.path) else {
                debug!("import: {} no longer resolves, skipped", info.path);
                report.skipped += 1;
                continue;
            };
            let slot = match info.source_type {
                SourceType::GeometryProcedural => ParameterSlot::Procedural {
                    modifier: info.modifier_name.clone(),
                    identifier: info.property_name.clone(),
                },
                SourceType::Custom => ParameterSlot::Custom {
                    name: info.property_name.clone(),
                },
            };
            match host.apply_value(object, &slot, info.value.to_host()) {
                Ok(()) => {
                    report.applied += 1;
                    applied.insert(object);
                    state.last_hash.remove(&info.path);
                }
                Err(e) => {
                    warn!("import: {} {}: {}", info.path, slot, e);
                    report.skipped += 1;
                }
            }
        }

        for &object in &applied {
            host.mark_needs_recompute(object);
        }
        report.recomputed = applied.into_iter().collect();
        debug!(
            "import: {} applied, {} skipped, {} objects tagged",
            report.applied,
            report.skipped,
            report.recomputed.len()
        );
        report
    }

    /// Forget every remembered export hash.
    pub fn reset(&self) {
        self.lock().last_hash.clear();
    }
}
