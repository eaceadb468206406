//! Procedural instance discovery.
//!
//! Walks the host's evaluated instance collection and reports every generated
//! mesh instance under the record path of its template object, with the world
//! matrix already converted to the destination convention.
//!
//! The host iteration is scoped: [`InstanceScope`] releases it when dropped,
//! which covers every skip and early exit below.
//!
//! [`InstanceScope`]: crate::entities::host::InstanceScope

use std::collections::HashMap;

use glam::Mat4;
use indexmap::IndexMap;
use log::{debug, trace};

use crate::entities::host::{DataId, HostError, HostScene, ObjectId, ObjectKind};
use crate::entities::transform::host_to_destination;

use super::records::RecordTracker;

/// Instance transforms grouped by template path, in first-seen order.
pub type GroupedInstances = IndexMap<String, Vec<Mat4>>;

/// Map every data-block to a scene object that uses it.
///
/// Shared data resolves to the last object in scene order.
pub fn data_index(host: &dyn HostScene) -> HashMap<DataId, ObjectId> {
    let mut index = HashMap::new();
    for object in host.scene_objects() {
        if let Some(data) = host.object_data(object) {
            index.insert(data, object);
        }
    }
    index
}

/// Stream every generated mesh instance as `(template path, converted world)`.
///
/// Returns the number of delivered instances. Fails only when the host cannot
/// open the iteration, in which case `visit` is never called.
pub fn enumerate_instances<F>(host: &dyn HostScene, tracker: &RecordTracker, mut visit: F) -> Result<usize, HostError>
where
    F: FnMut(&str, Mat4),
{
    let index = data_index(host);
    let scope = host.evaluated_instances()?;
    let mut paths: HashMap<ObjectId, Option<String>> = HashMap::new();
    let mut delivered = 0;

    for instance in scope {
        if instance.object.is_none() || !instance.is_instance || instance.kind != ObjectKind::Mesh {
            continue;
        }
        let Some(template) = instance.data.and_then(|d| index.get(&d).copied()) else {
            trace!("instances: data {:?} has no template object", instance.data);
            continue;
        };
        let path = paths
            .entry(template)
            .or_insert_with(|| tracker.record_path(host, template));
        let Some(path) = path.as_deref() else {
            continue;
        };

        visit(path, host_to_destination(instance.world));
        delivered += 1;
    }

    debug!("instances: {} delivered", delivered);
    Ok(delivered)
}

/// Collect every instance, grouped per template path.
pub fn collect_instances(host: &dyn HostScene, tracker: &RecordTracker) -> Result<GroupedInstances, HostError> {
    let mut grouped = GroupedInstances::new();
    enumerate_instances(host, tracker, |path, world| {
        grouped.entry(path.to_string()).or_default().push(world);
    })?;
    Ok(grouped)
}

/// Grouped variant of [`enumerate_instances`]: `visit` runs once per template
/// path, after the whole collection has been walked.
pub fn enumerate_grouped<F>(host: &dyn HostScene, tracker: &RecordTracker, mut visit: F) -> Result<usize, HostError>
where
    F: FnMut(&str, &[Mat4]),
{
    let grouped = collect_instances(host, tracker)?;
    for (path, transforms) in &grouped {
        visit(path, transforms);
    }
    Ok(grouped.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::destination::RecordingDestination;
    use crate::entities::memory_scene::MemoryScene;
    use glam::Vec3;
    use serde_json::json;
    use std::sync::Arc;

    fn translation(x: f32, y: f32, z: f32) -> Vec<f32> {
        Mat4::from_translation(Vec3::new(x, y, z)).to_cols_array().to_vec()
    }

    fn scene() -> MemoryScene {
        let desc = json!({
            "objects": [
                { "id": 1, "name": "Rock", "kind": "Mesh", "data": 100 },
                { "id": 2, "name": "Scatter", "kind": "Mesh", "data": 200 },
                { "id": 3, "name": "Tree", "kind": "Mesh", "data": 300 },
                { "id": 4, "name": "RockCopy", "kind": "Mesh", "data": 100 }
            ],
            "instances": [
                { "object": 2, "is_instance": false, "kind": "Mesh", "data": 200 },
                { "object": 2, "is_instance": true, "kind": "Mesh", "data": 100, "world": translation(1.0, 0.0, 0.0) },
                { "object": 2, "is_instance": true, "kind": "Mesh", "data": 100, "world": translation(0.0, 0.0, 2.0) }
            ]
        });
        MemoryScene::new(serde_json::from_value(desc).unwrap())
    }

    fn tracker() -> RecordTracker {
        RecordTracker::new(Arc::new(RecordingDestination::new()), false)
    }

    #[test]
    fn test_data_index_last_owner_wins() {
        let host = scene();
        let index = data_index(&host);
        assert_eq!(index.get(&DataId(100)), Some(&ObjectId(4)));
        assert_eq!(index.get(&DataId(300)), Some(&ObjectId(3)));
        assert_eq!(index.len(), 3);

        // Removing the later owner hands the data back to the earlier one
        host.remove_object(ObjectId(4));
        assert_eq!(data_index(&host).get(&DataId(100)), Some(&ObjectId(1)));
    }

    #[test]
    fn test_grouped_visit_once_in_order() {
        let host = scene();
        let mut calls = Vec::new();
        let groups = enumerate_grouped(&host, &tracker(), |path, transforms| {
            calls.push((path.to_string(), transforms.to_vec()));
        })
        .unwrap();

        assert_eq!(groups, 1);
        assert_eq!(calls.len(), 1);
        let (path, transforms) = &calls[0];
        assert_eq!(path, "/RockCopy");
        assert_eq!(transforms.len(), 2);
        // host +X becomes destination -X, host +Z becomes destination +Y
        assert!(transforms[0].w_axis.truncate().abs_diff_eq(Vec3::new(-1.0, 0.0, 0.0), 1e-5));
        assert!(transforms[1].w_axis.truncate().abs_diff_eq(Vec3::new(0.0, 2.0, 0.0), 1e-5));
        assert_eq!(host.iteration_counts(), (1, 1));
    }

    #[test]
    fn test_skip_rules() {
        let host = scene();
        host.set_instances(
            serde_json::from_value(json!([
                { "object": null, "is_instance": true, "kind": "Mesh", "data": 100 },
                { "object": 2, "is_instance": true, "kind": "Curve", "data": 100 },
                { "object": 2, "is_instance": true, "kind": "Mesh", "data": 999 },
                { "object": 2, "is_instance": true, "kind": "Mesh" },
                { "object": 2, "is_instance": true, "kind": "Mesh", "data": 300 }
            ]))
            .unwrap(),
        );
        let mut seen = Vec::new();
        let delivered = enumerate_instances(&host, &tracker(), |path, _| seen.push(path.to_string())).unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(seen, vec!["/Tree".to_string()]);
    }

    #[test]
    fn test_open_failure_delivers_nothing() {
        let host = scene();
        host.set_iteration_failure(true);
        let mut called = false;
        let err = enumerate_instances(&host, &tracker(), |_, _| called = true).unwrap_err();
        assert!(matches!(err, HostError::IterationUnavailable(_)));
        assert!(!called);
        assert!(collect_instances(&host, &tracker()).is_err());
    }

    #[test]
    fn test_scope_released_on_panic() {
        let host = scene();
        let tracker = tracker();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = enumerate_instances(&host, &tracker, |_, _| panic!("consumer failed"));
        }));
        assert!(result.is_err());
        assert_eq!(host.iteration_counts(), (1, 1));
    }

    #[test]
    fn test_tracked_template_uses_record_path() {
        let host = scene();
        let tracker = tracker();
        tracker.touch_group_member(&host, ObjectId(3), ObjectId(4), false);
        tracker.touch_record(&host, ObjectId(4), "", false);
        host.rename_object(ObjectId(4), "Boulder");
        let grouped = collect_instances(&host, &tracker).unwrap();
        // Published path wins until the next pass touches the record again
        assert_eq!(grouped.keys().collect::<Vec<_>>(), vec!["/RockCopy"]);
    }
}
