//! Per-pass object record reconciliation.
//!
//! One [`ObjectRecord`] exists per (host object, instancing base path) pair: an
//! object reached through several instancing groups backs several records, and
//! only the resulting path is unique.
//!
//! Pass lifecycle:
//! 1. [`RecordTracker::clear_records_state`] resets `touched`/`renamed`
//! 2. [`RecordTracker::touch_record`] for every live object (concurrently for disjoint subtrees)
//! 3. [`RecordTracker::erase_stale_objects`] drops whatever was not touched,
//!    releasing its destination transform
//!
//! Locking: the record map sits behind an `RwLock`. Lookups of existing records
//! take the read lock and can run in parallel; inserting a new record takes the
//! write lock, so insertion is serialized. Each record has its own mutex.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use log::{debug, trace};

use crate::entities::destination::{DestinationScene, TransformHandle};
use crate::entities::host::{BoneId, HostScene, ObjectId};

/// Tracker-side memory of one synchronized object.
#[derive(Debug)]
pub struct ObjectRecord {
    /// Destination identity: base path + host path
    pub path: String,
    /// Host display name at the last touch
    pub name: String,
    /// Parent instancing-group object, if reached through one
    pub host: Option<ObjectId>,
    pub object: ObjectId,
    /// Skeletal sub-element mirrored by this record, if any
    pub bone: Option<BoneId>,
    pub destination: TransformHandle,
    pub touched: bool,
    pub renamed: bool,
}

impl ObjectRecord {
    pub fn clear_state(&mut self) {
        self.touched = false;
        self.renamed = false;
    }
}

/// Shared handle to a record. Repeated touches hand out the same allocation.
pub type RecordRef = Arc<Mutex<ObjectRecord>>;

/// Lock a record, recovering from a poisoned mutex.
pub fn lock_record(record: &RecordRef) -> MutexGuard<'_, ObjectRecord> {
    record.lock().unwrap_or_else(|e| e.into_inner())
}

/// Key of the record map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RecordKey {
    object: ObjectId,
    base_path: String,
}

/// Destination entry of an armature bone.
#[derive(Debug)]
pub struct BoneEntry {
    pub path: String,
    pub destination: TransformHandle,
    pub touched: bool,
    /// Path changed this pass (armature renamed or moved)
    pub renamed: bool,
}

/// Counts returned by a stale sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub records: usize,
    pub bones: usize,
}

/// Owner of every record, bone entry and the pending set.
pub struct RecordTracker {
    destination: Arc<dyn DestinationScene>,
    records: RwLock<HashMap<RecordKey, RecordRef>>,
    bones: Mutex<HashMap<BoneId, BoneEntry>>,
    pending: Mutex<HashSet<ObjectId>>,
    track_bones: bool,
    /// Records ever created, for per-pass reporting
    created: AtomicUsize,
}

impl RecordTracker {
    pub fn new(destination: Arc<dyn DestinationScene>, track_bones: bool) -> Self {
        Self {
            destination,
            records: RwLock::new(HashMap::new()),
            bones: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            track_bones,
            created: AtomicUsize::new(0),
        }
    }

    // ========== Pass operations ==========

    /// Touch the record of `object` under `base_path`, creating it on first sight.
    ///
    /// Returns `None` when the host no longer knows the object (removed mid-pass).
    /// With `include_children`, every direct child is touched recursively under
    /// the same base path.
    pub fn touch_record(
        &self,
        host: &dyn HostScene,
        object: ObjectId,
        base_path: &str,
        include_children: bool,
    ) -> Option<RecordRef> {
        self.touch_in_group(host, None, object, base_path, include_children)
    }

    /// Touch an object reached through an instancing group.
    ///
    /// The base path is the group's own path; the record remembers the group as `host`.
    pub fn touch_group_member(
        &self,
        host: &dyn HostScene,
        group: ObjectId,
        object: ObjectId,
        include_children: bool,
    ) -> Option<RecordRef> {
        let base_path = host.object_path(group)?;
        self.touch_in_group(host, Some(group), object, &base_path, include_children)
    }

    fn touch_in_group(
        &self,
        host: &dyn HostScene,
        group: Option<ObjectId>,
        object: ObjectId,
        base_path: &str,
        include_children: bool,
    ) -> Option<RecordRef> {
        let local_path = host.object_path(object)?;
        let name = host.object_name(object)?;
        let path = format!("{}{}", base_path, local_path);

        let record = self.get_or_insert(object, base_path, &path, &name, group);
        {
            let mut rec = lock_record(&record);
            if rec.name != name {
                debug!("record renamed: {} -> {} ({})", rec.name, name, path);
                rec.name = name;
                rec.renamed = true;
            }
            if rec.path != path {
                rec.destination.set_path(&path);
                rec.path = path;
                rec.renamed = true;
            }
            rec.host = group;
            rec.touched = true;
        }

        if self.track_bones {
            self.touch_bones(host, object, base_path);
        }

        if include_children {
            for child in host.children(object) {
                self.touch_in_group(host, group, child, base_path, true);
            }
        }
        Some(record)
    }

    fn get_or_insert(
        &self,
        object: ObjectId,
        base_path: &str,
        path: &str,
        name: &str,
        group: Option<ObjectId>,
    ) -> RecordRef {
        let key = RecordKey {
            object,
            base_path: base_path.to_string(),
        };

        // Fast path: shared lookup
        if let Some(existing) = self.records.read().unwrap_or_else(|e| e.into_inner()).get(&key) {
            return Arc::clone(existing);
        }

        // Slow path: serialized insertion, re-checked under the write lock
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let record = records.entry(key).or_insert_with(|| {
            debug!("record created: {}", path);
            self.created.fetch_add(1, Ordering::Relaxed);
            Arc::new(Mutex::new(ObjectRecord {
                path: path.to_string(),
                name: name.to_string(),
                host: group,
                object,
                bone: None,
                destination: TransformHandle::create(Arc::clone(&self.destination), path),
                touched: false,
                renamed: false,
            }))
        });
        Arc::clone(record)
    }

    fn touch_bones(&self, host: &dyn HostScene, object: ObjectId, base_path: &str) {
        let bones = host.bones(object);
        if bones.is_empty() {
            return;
        }
        let mut entries = self.bones.lock().unwrap_or_else(|e| e.into_inner());
        for bone in bones {
            let Some(local) = host.bone_path(object, bone) else {
                continue;
            };
            let path = format!("{}{}", base_path, local);
            let entry = entries.entry(bone).or_insert_with(|| {
                trace!("bone created: {}", path);
                BoneEntry {
                    path: path.clone(),
                    destination: TransformHandle::create(Arc::clone(&self.destination), &path),
                    touched: false,
                    renamed: false,
                }
            });
            if entry.path != path {
                entry.destination.set_path(&path);
                entry.path = path;
                entry.renamed = true;
            }
            entry.touched = true;
        }
    }

    /// Reset `touched`/`renamed` on every record and bone entry. Removes nothing.
    pub fn clear_records_state(&self) {
        for record in self.records.read().unwrap_or_else(|e| e.into_inner()).values() {
            lock_record(record).clear_state();
        }
        for bone in self.bones.lock().unwrap_or_else(|e| e.into_inner()).values_mut() {
            bone.touched = false;
            bone.renamed = false;
        }
    }

    /// Remove every record and bone entry left untouched by the pass.
    ///
    /// Dropping an entry drops its [`TransformHandle`], which releases the
    /// destination transform.
    pub fn erase_stale_objects(&self) -> SweepStats {
        let mut stats = SweepStats::default();

        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.retain(|_, record| {
            let rec = lock_record(record);
            if !rec.touched {
                debug!("record erased: {}", rec.path);
                stats.records += 1;
            }
            rec.touched
        });
        drop(records);

        let mut bones = self.bones.lock().unwrap_or_else(|e| e.into_inner());
        bones.retain(|_, bone| {
            if !bone.touched {
                trace!("bone erased: {}", bone.path);
                stats.bones += 1;
            }
            bone.touched
        });

        stats
    }

    /// Drop every record (session end / full rebuild).
    pub fn erase_object_records(&self) {
        let removed = std::mem::take(&mut *self.records.write().unwrap_or_else(|e| e.into_inner()));
        debug!("erasing all {} records", removed.len());
    }

    /// Full teardown: records, bones and the pending set.
    pub fn clear(&self) {
        self.erase_object_records();
        self.bones.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    // ========== Pending set ==========

    /// Queue an object for processing this pass. Returns false if already queued.
    pub fn queue(&self, object: ObjectId) -> bool {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(object)
    }

    pub fn is_pending(&self, object: ObjectId) -> bool {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).contains(&object)
    }

    /// Take the pending set, sorted by handle for a stable processing order.
    pub fn flush_pending(&self) -> Vec<ObjectId> {
        let taken = std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()));
        let mut objects: Vec<ObjectId> = taken.into_iter().collect();
        objects.sort();
        objects
    }

    // ========== Lookups ==========

    /// Record of `object` outside any instancing group.
    ///
    /// Objects never touched (or already erased) are simply not found.
    pub fn find(&self, object: ObjectId) -> Option<RecordRef> {
        self.find_in(object, "")
    }

    pub fn find_in(&self, object: ObjectId, base_path: &str) -> Option<RecordRef> {
        let key = RecordKey {
            object,
            base_path: base_path.to_string(),
        };
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
    }

    /// Record currently published under `path`.
    pub fn find_by_path(&self, path: &str) -> Option<RecordRef> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|r| lock_record(r).path == path)
            .cloned()
    }

    /// Path an object is published under: its direct record if tracked,
    /// otherwise the host path.
    pub fn record_path(&self, host: &dyn HostScene, object: ObjectId) -> Option<String> {
        match self.find(object) {
            Some(record) => Some(lock_record(&record).path.clone()),
            None => host.object_path(object),
        }
    }

    pub fn bone_path(&self, bone: BoneId) -> Option<String> {
        self.bones
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&bone)
            .map(|b| b.path.clone())
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total records created since the tracker was built.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn bone_count(&self) -> usize {
        self.bones.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Paths of bone entries whose path changed this pass, sorted.
    pub fn renamed_bones(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .bones
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|b| b.renamed)
            .map(|b| b.path.clone())
            .collect();
        paths.sort();
        paths
    }

    /// Paths of all records, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|r| lock_record(r).path.clone())
            .collect();
        paths.sort();
        paths
    }

    /// Paths of records flagged `renamed` in the current pass, sorted.
    pub fn renamed_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter_map(|r| {
                let rec = lock_record(r);
                rec.renamed.then(|| rec.path.clone())
            })
            .collect();
        paths.sort();
        paths
    }

    /// Objects whose records were touched this pass, deduplicated and sorted.
    pub fn touched_objects(&self) -> Vec<ObjectId> {
        let mut objects: Vec<ObjectId> = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter_map(|r| {
                let rec = lock_record(r);
                rec.touched.then_some(rec.object)
            })
            .collect();
        objects.sort();
        objects.dedup();
        objects
    }
}

impl std::fmt::Debug for RecordTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordTracker")
            .field("records", &self.len())
            .field("bones", &self.bone_count())
            .field("track_bones", &self.track_bones)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::destination::RecordingDestination;
    use crate::entities::memory_scene::MemoryScene;
    use serde_json::json;

    fn setup(track_bones: bool) -> (MemoryScene, Arc<RecordingDestination>, RecordTracker) {
        let desc = json!({
            "objects": [
                { "id": 1, "name": "A", "kind": "Mesh" },
                { "id": 2, "name": "B", "kind": "Empty" },
                { "id": 3, "name": "C", "parent": 2, "kind": "Mesh" },
                { "id": 4, "name": "Rig", "kind": "Armature",
                  "bones": [ { "id": 40, "name": "Root" }, { "id": 41, "name": "Tip", "parent": 40 } ] }
            ]
        });
        let scene = MemoryScene::new(serde_json::from_value(desc).unwrap());
        let dst = Arc::new(RecordingDestination::new());
        let tracker = RecordTracker::new(dst.clone(), track_bones);
        (scene, dst, tracker)
    }

    #[test]
    fn test_touch_creates_and_flags() {
        let (scene, dst, tracker) = setup(false);
        let rec = tracker.touch_record(&scene, ObjectId(1), "", false).unwrap();
        {
            let r = lock_record(&rec);
            assert_eq!(r.path, "/A");
            assert_eq!(r.name, "A");
            assert!(r.touched);
            assert!(!r.renamed);
            assert_eq!(r.destination.path(), "/A");
        }
        assert_eq!(dst.stats().created, 1);
    }

    #[test]
    fn test_touch_twice_is_idempotent() {
        let (scene, dst, tracker) = setup(false);
        let first = tracker.touch_record(&scene, ObjectId(1), "", false).unwrap();
        let second = tracker.touch_record(&scene, ObjectId(1), "", false).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!lock_record(&second).renamed);
        assert_eq!(tracker.len(), 1);
        assert_eq!(dst.stats().created, 1);
        assert_eq!(tracker.created_count(), 1);
    }

    #[test]
    fn test_record_path_falls_back_to_host() {
        let (scene, _dst, tracker) = setup(false);
        assert_eq!(tracker.record_path(&scene, ObjectId(3)).as_deref(), Some("/B/C"));
        tracker.touch_record(&scene, ObjectId(1), "", false);
        scene.rename_object(ObjectId(1), "A2");
        // Tracked objects keep their published path until the next touch
        assert_eq!(tracker.record_path(&scene, ObjectId(1)).as_deref(), Some("/A"));
        assert!(tracker.record_path(&scene, ObjectId(99)).is_none());
    }

    #[test]
    fn test_children_are_touched_recursively() {
        let (scene, _dst, tracker) = setup(false);
        tracker.touch_record(&scene, ObjectId(2), "", true).unwrap();
        assert_eq!(tracker.paths(), vec!["/B".to_string(), "/B/C".to_string()]);
        assert!(lock_record(&tracker.find(ObjectId(3)).unwrap()).touched);
    }

    #[test]
    fn test_untouched_record_is_erased_once() {
        let (scene, dst, tracker) = setup(false);

        // pass 1
        tracker.clear_records_state();
        tracker.touch_record(&scene, ObjectId(1), "", false);
        tracker.touch_record(&scene, ObjectId(2), "", true);
        assert_eq!(tracker.erase_stale_objects(), SweepStats::default());

        // pass 2: A not visited
        tracker.clear_records_state();
        tracker.touch_record(&scene, ObjectId(2), "", true);
        let stats = tracker.erase_stale_objects();
        assert_eq!(stats.records, 1);
        assert!(tracker.find(ObjectId(1)).is_none());
        assert_eq!(dst.release_count("/A"), 1);
        assert_eq!(dst.stats().live, 2);

        // pass 3: nothing more to release for A
        tracker.clear_records_state();
        tracker.touch_record(&scene, ObjectId(2), "", true);
        tracker.erase_stale_objects();
        assert_eq!(dst.release_count("/A"), 1);
    }

    #[test]
    fn test_rename_is_flagged_and_cleared() {
        let (scene, dst, tracker) = setup(false);
        tracker.touch_record(&scene, ObjectId(1), "", false);

        tracker.clear_records_state();
        scene.rename_object(ObjectId(1), "A2");
        let rec = tracker.touch_record(&scene, ObjectId(1), "", false).unwrap();
        {
            let r = lock_record(&rec);
            assert!(r.renamed);
            assert_eq!(r.name, "A2");
            assert_eq!(r.path, "/A2");
        }
        assert_eq!(tracker.renamed_paths(), vec!["/A2".to_string()]);
        assert_eq!(dst.live_paths(), vec!["/A2".to_string()]);

        tracker.clear_records_state();
        let rec = tracker.touch_record(&scene, ObjectId(1), "", false).unwrap();
        assert!(!lock_record(&rec).renamed);
    }

    #[test]
    fn test_bone_rename_is_flagged_and_cleared() {
        let (scene, dst, tracker) = setup(true);
        tracker.touch_record(&scene, ObjectId(4), "", false);
        assert!(tracker.renamed_bones().is_empty());

        tracker.clear_records_state();
        scene.rename_object(ObjectId(4), "Rig2");
        tracker.touch_record(&scene, ObjectId(4), "", false);
        assert_eq!(
            tracker.renamed_bones(),
            vec!["/Rig2/Root".to_string(), "/Rig2/Root/Tip".to_string()]
        );
        assert_eq!(dst.stats().released, 0);

        tracker.clear_records_state();
        assert!(tracker.renamed_bones().is_empty());
        tracker.touch_record(&scene, ObjectId(4), "", false);
        assert!(tracker.renamed_bones().is_empty());
    }

    #[test]
    fn test_missing_object_is_not_found() {
        let (scene, _dst, tracker) = setup(false);
        assert!(tracker.touch_record(&scene, ObjectId(99), "", false).is_none());
        assert!(tracker.find(ObjectId(1)).is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_group_members_get_distinct_records() {
        let (scene, dst, tracker) = setup(false);
        let direct = tracker.touch_record(&scene, ObjectId(1), "", false).unwrap();
        let grouped = tracker.touch_group_member(&scene, ObjectId(2), ObjectId(1), false).unwrap();
        assert!(!Arc::ptr_eq(&direct, &grouped));
        {
            let g = lock_record(&grouped);
            assert_eq!(g.path, "/B/A");
            assert_eq!(g.host, Some(ObjectId(2)));
        }
        assert!(tracker.find_in(ObjectId(1), "/B").is_some());
        assert!(tracker.find_by_path("/B/A").is_some());
        assert_eq!(dst.stats().live, 2);
    }

    #[test]
    fn test_bones_follow_record_lifecycle() {
        let (scene, dst, tracker) = setup(true);
        tracker.touch_record(&scene, ObjectId(4), "", false);
        assert_eq!(tracker.bone_count(), 2);
        assert_eq!(tracker.bone_path(BoneId(41)).as_deref(), Some("/Rig/Root/Tip"));

        tracker.clear_records_state();
        let stats = tracker.erase_stale_objects();
        assert_eq!(stats, SweepStats { records: 1, bones: 2 });
        assert_eq!(dst.stats().live, 0);
    }

    #[test]
    fn test_clear_releases_everything() {
        let (scene, dst, tracker) = setup(true);
        for root in scene.root_objects() {
            tracker.touch_record(&scene, root, "", true);
        }
        tracker.queue(ObjectId(1));
        tracker.clear();
        assert!(tracker.is_empty());
        assert_eq!(tracker.bone_count(), 0);
        assert!(!tracker.is_pending(ObjectId(1)));
        assert_eq!(dst.stats().live, 0);
        assert_eq!(dst.stats().released, dst.stats().created);
    }

    #[test]
    fn test_pending_set_is_transient() {
        let (_scene, _dst, tracker) = setup(false);
        assert!(tracker.queue(ObjectId(2)));
        assert!(!tracker.queue(ObjectId(2)));
        tracker.queue(ObjectId(1));
        assert_eq!(tracker.flush_pending(), vec![ObjectId(1), ObjectId(2)]);
        assert!(tracker.flush_pending().is_empty());
    }

    #[test]
    fn test_concurrent_touch_of_disjoint_subtrees() {
        let (scene, dst, tracker) = setup(true);
        let scene = Arc::new(scene);
        let tracker = Arc::new(tracker);

        std::thread::scope(|s| {
            for root in scene.root_objects() {
                let scene = Arc::clone(&scene);
                let tracker = Arc::clone(&tracker);
                s.spawn(move || {
                    tracker.touch_record(scene.as_ref(), root, "", true);
                });
            }
        });

        assert_eq!(tracker.len(), 4);
        assert_eq!(dst.stats().created, 4 + 2);
        assert_eq!(tracker.touched_objects().len(), 4);
    }
}
