//! Sync session: one reconciliation pass at a time.
//!
//! A pass:
//! 1. clears per-pass record flags
//! 2. touches every object of the hierarchy as its own parallel task
//! 3. after the barrier, re-enumerates instances if the instance set is dirty
//! 4. sweeps stale records, deferred behind the enumeration
//! 5. exports parameters of pending objects
//!
//! A failing task or an unavailable instance iteration aborts the pass with
//! [`SyncError`]; records, the pending set and the dirty flags are left for the
//! next pass to reconcile.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use log::{debug, info};

use crate::config::SyncSettings;
use crate::entities::destination::DestinationScene;
use crate::entities::host::{HostError, HostScene, ObjectId};
use crate::entities::property::PropertyBatch;

use super::error::SyncError;
use super::instances::{GroupedInstances, collect_instances};
use super::properties::{ImportReport, PropertySync};
use super::records::{RecordTracker, SweepStats};
use super::tasks::{TaskController, TaskError, TaskKind};
use super::workers::Workers;

/// Result of one [`SyncSession::sync_pass`].
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    /// 1-based pass counter
    pub pass: u64,
    /// Live records after the sweep
    pub touched: usize,
    /// Records created during this pass
    pub created: usize,
    /// Paths of records renamed during this pass, sorted
    pub renamed: Vec<String>,
    pub erased: SweepStats,
    /// Present when instances were re-enumerated this pass
    pub instances: Option<GroupedInstances>,
    /// Exported parameters of the objects pending this pass
    pub properties: PropertyBatch,
}

/// Owns the tracker, the property engine and the task controller for one
/// host/destination pair.
pub struct SyncSession {
    host: Arc<dyn HostScene>,
    tracker: Arc<RecordTracker>,
    properties: PropertySync,
    tasks: TaskController,
    settings: SyncSettings,
    full_sync: bool,
    instances_dirty: bool,
    passes: u64,
}

impl SyncSession {
    /// Start a session with its own worker pool.
    pub fn new(
        host: Arc<dyn HostScene>,
        destination: Arc<dyn DestinationScene>,
        settings: SyncSettings,
    ) -> Result<Self, SyncError> {
        let workers = Arc::new(Workers::new(settings.worker_count())?);
        Ok(Self::with_workers(host, destination, settings, workers))
    }

    /// Start a session on a shared worker pool.
    pub fn with_workers(
        host: Arc<dyn HostScene>,
        destination: Arc<dyn DestinationScene>,
        settings: SyncSettings,
        workers: Arc<Workers>,
    ) -> Self {
        let tracker = Arc::new(RecordTracker::new(destination, settings.sync_bones));
        debug!("session: {:?} on {:?}", settings, workers);
        Self {
            host,
            properties: PropertySync::new(Arc::clone(&tracker)),
            tracker,
            tasks: TaskController::new(workers),
            settings,
            full_sync: true,
            instances_dirty: true,
            passes: 0,
        }
    }

    pub fn tracker(&self) -> &RecordTracker {
        &self.tracker
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Queue an object for parameter export in the next pass.
    pub fn queue(&self, object: ObjectId) -> bool {
        self.tracker.queue(object)
    }

    /// Export every object on the next pass, changed or not.
    pub fn request_full_sync(&mut self) {
        self.full_sync = true;
        self.properties.reset();
    }

    /// Re-enumerate instances on the next pass.
    pub fn mark_instances_dirty(&mut self) {
        self.instances_dirty = true;
    }

    /// Run one full reconciliation pass.
    pub fn sync_pass(&mut self) -> Result<PassReport, SyncError> {
        let pass = self.passes + 1;
        let created_before = self.tracker.created_count();
        self.tracker.clear_records_state();

        if self.full_sync {
            for object in self.host.scene_objects() {
                self.tracker.queue(object);
            }
        }

        // One parallel task per object; the barrier marks the whole tree as touched
        let mut visited = HashSet::new();
        let mut stack = self.host.root_objects();
        while let Some(object) = stack.pop() {
            if !visited.insert(object) {
                continue;
            }
            stack.extend(self.host.children(object));

            let host = Arc::clone(&self.host);
            let tracker = Arc::clone(&self.tracker);
            self.tasks.submit(TaskKind::Parallel, move || {
                if tracker.touch_record(host.as_ref(), object, "", false).is_none() {
                    debug!("pass: {} vanished before touch", object);
                }
                Ok(())
            });
        }

        // Deferred, in order: enumeration first so a failed open skips the sweep
        let enumerated: Arc<Mutex<Option<GroupedInstances>>> = Arc::new(Mutex::new(None));
        if self.settings.sync_instances && self.instances_dirty {
            let host = Arc::clone(&self.host);
            let tracker = Arc::clone(&self.tracker);
            let slot = Arc::clone(&enumerated);
            self.tasks.submit(TaskKind::Deferred, move || {
                let grouped = collect_instances(host.as_ref(), &tracker)?;
                *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(grouped);
                Ok(())
            });
        }

        let sweep = Arc::new(Mutex::new(SweepStats::default()));
        {
            let tracker = Arc::clone(&self.tracker);
            let sweep = Arc::clone(&sweep);
            self.tasks.submit(TaskKind::Deferred, move || {
                *sweep.lock().unwrap_or_else(|e| e.into_inner()) = tracker.erase_stale_objects();
                Ok(())
            });
        }

        if let Err(e) = self.tasks.wait() {
            return Err(match e {
                TaskError::Deferred { index, source } => match source.downcast::<HostError>() {
                    Ok(host) => SyncError::Host(host),
                    Err(source) => SyncError::Task(TaskError::Deferred { index, source }),
                },
                other => SyncError::Task(other),
            });
        }
        let erased = *sweep.lock().unwrap_or_else(|e| e.into_inner());
        let instances = enumerated.lock().unwrap_or_else(|e| e.into_inner()).take();
        if instances.is_some() {
            self.instances_dirty = false;
        }

        let mut properties = PropertyBatch::new();
        let pending = self.tracker.flush_pending();
        if self.settings.sync_properties {
            for object in pending {
                let batch = if self.settings.export_changed_only {
                    self.properties.export_changed(self.host.as_ref(), object)
                } else {
                    self.properties.export_properties(self.host.as_ref(), object)
                };
                properties.extend(batch);
            }
        }

        self.full_sync = false;
        self.passes = pass;

        let report = PassReport {
            pass,
            touched: self.tracker.len(),
            created: self.tracker.created_count() - created_before,
            renamed: self.tracker.renamed_paths(),
            erased,
            instances,
            properties,
        };
        info!(
            "pass {}: {} records ({} new, {} renamed, {} erased), {} instance groups, {} properties",
            report.pass,
            report.touched,
            report.created,
            report.renamed.len(),
            report.erased.records,
            report.instances.as_ref().map_or(0, |g| g.len()),
            report.properties.len()
        );
        Ok(report)
    }

    /// Apply parameter edits coming back from the consumer.
    ///
    /// Updated objects are queued for re-export and the instance set is marked
    /// dirty, since recomputed procedural geometry may instance differently.
    pub fn import_properties(&mut self, batch: &PropertyBatch) -> ImportReport {
        let report = self.properties.import_properties(self.host.as_ref(), batch);
        for &object in &report.recomputed {
            self.tracker.queue(object);
        }
        if !report.recomputed.is_empty() {
            self.instances_dirty = true;
        }
        report
    }

    /// Release every destination transform and start over on the next pass.
    pub fn teardown(&mut self) {
        info!("session teardown: releasing {} records", self.tracker.len());
        self.tracker.clear();
        self.properties.reset();
        self.full_sync = true;
        self.instances_dirty = true;
    }
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("tracker", &self.tracker)
            .field("tasks", &self.tasks)
            .field("passes", &self.passes)
            .field("full_sync", &self.full_sync)
            .field("instances_dirty", &self.instances_dirty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::destination::RecordingDestination;
    use crate::entities::memory_scene::MemoryScene;
    use serde_json::json;

    fn session(settings: SyncSettings) -> (Arc<MemoryScene>, Arc<RecordingDestination>, SyncSession) {
        let desc = json!({
            "objects": [
                { "id": 1, "name": "Cube", "kind": "Mesh", "data": 100,
                  "custom": [ { "name": "size", "value": { "Float": 1.0 }, "ui": {} } ] },
                { "id": 2, "name": "Lamp", "kind": "Light" }
            ],
            "instances": [
                { "object": 1, "is_instance": true, "kind": "Mesh", "data": 100 }
            ]
        });
        let host = Arc::new(MemoryScene::new(serde_json::from_value(desc).unwrap()));
        let dst = Arc::new(RecordingDestination::new());
        let workers = Arc::new(Workers::new(2).unwrap());
        let session = SyncSession::with_workers(host.clone(), dst.clone(), settings, workers);
        (host, dst, session)
    }

    #[test]
    fn test_first_pass_exports_everything() {
        let (_host, dst, mut session) = session(SyncSettings::default());
        let report = session.sync_pass().unwrap();
        assert_eq!(report.pass, 1);
        assert_eq!(report.touched, 2);
        assert_eq!(report.created, 2);
        assert_eq!(report.properties.len(), 1);
        assert_eq!(report.instances.as_ref().map(|g| g.len()), Some(1));
        assert_eq!(dst.stats().live, 2);

        let second = session.sync_pass().unwrap();
        assert_eq!(second.created, 0);
        assert!(second.properties.is_empty());
        assert!(second.instances.is_none());
    }

    #[test]
    fn test_import_requeues_and_dirties_instances() {
        let (host, _dst, mut session) = session(SyncSettings::default());
        let first = session.sync_pass().unwrap();

        let mut edited = first.properties.clone().into_vec();
        edited[0].value = crate::entities::PropertyValue::Float { value: 2.0, min: f32::MIN, max: f32::MAX };
        let report = session.import_properties(&PropertyBatch::from(edited));
        assert_eq!(report.applied, 1);
        assert_eq!(host.recompute_count(ObjectId(1)), 1);

        let next = session.sync_pass().unwrap();
        assert_eq!(next.properties.len(), 1);
        assert!(next.instances.is_some());
    }

    #[test]
    fn test_disabled_features_are_skipped() {
        let settings = SyncSettings {
            sync_instances: false,
            sync_properties: false,
            ..Default::default()
        };
        let (host, _dst, mut session) = session(settings);
        let report = session.sync_pass().unwrap();
        assert!(report.instances.is_none());
        assert!(report.properties.is_empty());
        assert_eq!(host.iteration_counts(), (0, 0));
        // Pending set is still consumed
        assert!(!session.tracker().is_pending(ObjectId(1)));
    }

    #[test]
    fn test_teardown_releases_and_restarts_full() {
        let (_host, dst, mut session) = session(SyncSettings::default());
        session.sync_pass().unwrap();
        session.teardown();
        assert_eq!(dst.stats().live, 0);
        assert!(session.tracker().is_empty());

        let report = session.sync_pass().unwrap();
        assert_eq!(report.created, 2);
        assert_eq!(report.properties.len(), 1);
        assert!(report.instances.is_some());
    }
}
