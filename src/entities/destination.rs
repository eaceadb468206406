//! Destination-side transform handles.
//!
//! Every tracked record owns one [`TransformHandle`]. The handle is created on
//! the record's first touch and releases its destination transform when it is
//! dropped, so erasing a record releases exactly once.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::trace;
use uuid::Uuid;

/// Identity of a transform on the destination side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DestinationId(pub Uuid);

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Destination-side transform store (real-time engine mirror).
pub trait DestinationScene: Send + Sync {
    fn create_transform(&self, path: &str) -> DestinationId;
    fn rename_transform(&self, id: DestinationId, path: &str);
    fn release_transform(&self, id: DestinationId);
}

/// Exclusively owned destination transform.
pub struct TransformHandle {
    id: DestinationId,
    path: String,
    scene: Arc<dyn DestinationScene>,
}

impl TransformHandle {
    pub fn create(scene: Arc<dyn DestinationScene>, path: &str) -> Self {
        let id = scene.create_transform(path);
        Self {
            id,
            path: path.to_string(),
            scene,
        }
    }

    pub fn id(&self) -> DestinationId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Move the destination transform to a new path. No-op if unchanged.
    pub fn set_path(&mut self, path: &str) {
        if self.path != path {
            self.scene.rename_transform(self.id, path);
            self.path = path.to_string();
        }
    }
}

impl Drop for TransformHandle {
    fn drop(&mut self) {
        self.scene.release_transform(self.id);
    }
}

impl fmt::Debug for TransformHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformHandle")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

/// Counters snapshot of a [`RecordingDestination`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DestinationStats {
    pub created: usize,
    pub renamed: usize,
    pub released: usize,
    pub live: usize,
}

/// In-memory destination that records the live transform set.
#[derive(Debug, Default)]
pub struct RecordingDestination {
    live: Mutex<HashMap<DestinationId, String>>,
    releases: Mutex<HashMap<String, usize>>,
    created: AtomicUsize,
    renamed: AtomicUsize,
    released: AtomicUsize,
}

impl RecordingDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> DestinationStats {
        DestinationStats {
            created: self.created.load(Ordering::Relaxed),
            renamed: self.renamed.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            live: self.live.lock().unwrap_or_else(|e| e.into_inner()).len(),
        }
    }

    /// Paths of live transforms, sorted.
    pub fn live_paths(&self) -> Vec<String> {
        let live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        let mut paths: Vec<String> = live.values().cloned().collect();
        paths.sort();
        paths
    }

    /// How many times a transform last known under `path` was released.
    pub fn release_count(&self, path: &str) -> usize {
        self.releases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .copied()
            .unwrap_or(0)
    }
}

impl DestinationScene for RecordingDestination {
    fn create_transform(&self, path: &str) -> DestinationId {
        let id = DestinationId(Uuid::new_v4());
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, path.to_string());
        self.created.fetch_add(1, Ordering::Relaxed);
        trace!("destination: create {} -> {}", path, id);
        id
    }

    fn rename_transform(&self, id: DestinationId, path: &str) {
        if let Some(entry) = self.live.lock().unwrap_or_else(|e| e.into_inner()).get_mut(&id) {
            *entry = path.to_string();
            self.renamed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn release_transform(&self, id: DestinationId) {
        let removed = self.live.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
        if let Some(path) = removed {
            trace!("destination: release {} ({})", path, id);
            *self
                .releases
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .entry(path)
                .or_default() += 1;
            self.released.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_releases_on_drop() {
        let dst = Arc::new(RecordingDestination::new());
        let handle = TransformHandle::create(dst.clone(), "/A");
        assert_eq!(dst.stats().live, 1);
        assert_eq!(dst.live_paths(), vec!["/A".to_string()]);

        drop(handle);
        assert_eq!(
            dst.stats(),
            DestinationStats { created: 1, renamed: 0, released: 1, live: 0 }
        );
        assert_eq!(dst.release_count("/A"), 1);
    }

    #[test]
    fn test_set_path_renames_once() {
        let dst = Arc::new(RecordingDestination::new());
        let mut handle = TransformHandle::create(dst.clone(), "/A");
        handle.set_path("/A");
        assert_eq!(dst.stats().renamed, 0);
        handle.set_path("/B");
        assert_eq!(dst.stats().renamed, 1);
        assert_eq!(handle.path(), "/B");
        assert_eq!(dst.live_paths(), vec!["/B".to_string()]);
    }
}
