//! State shared between the mapper and read-only consumers (UI, export).
//!
//! Only the mapper writes; readers take a cloned [`MapSnapshot`] under a
//! short read lock so they never observe a half-applied optimization.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nalgebra::{Matrix4, Vector3};
use parking_lot::RwLock;

use crate::geometry::Extrinsics;
use crate::markers::{FrameId, MarkerId};

/// Complete, self-consistent view of the map after one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapSnapshot {
    pub origin: Option<MarkerId>,
    pub markers: BTreeMap<MarkerId, Extrinsics>,
    pub marker_points: BTreeMap<MarkerId, [Vector3<f64>; 4]>,
    /// Camera→world pose of the last localized frame.
    pub camera_pose: Option<Matrix4<f64>>,
    /// Last processed frame.
    pub frame_id: Option<FrameId>,
    /// Optimizations applied so far.
    pub optimizations: usize,
    /// Active key markers.
    pub key_markers: usize,
}

/// Shared between the mapper and its readers.
#[derive(Debug, Default)]
pub struct SharedState {
    snapshot: RwLock<MapSnapshot>,

    /// Set while a background bundle adjustment is in flight.
    optimizing: AtomicBool,
}

/// Handle readers keep to the mapper's published state.
pub type SnapshotHandle = Arc<SharedState>;

impl SharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Copy of the latest published snapshot.
    pub fn snapshot(&self) -> MapSnapshot {
        self.snapshot.read().clone()
    }

    /// Reads the snapshot in place without cloning it.
    pub fn with_snapshot<R>(&self, f: impl FnOnce(&MapSnapshot) -> R) -> R {
        f(&self.snapshot.read())
    }

    pub(crate) fn publish(&self, snapshot: MapSnapshot) {
        *self.snapshot.write() = snapshot;
    }

    pub fn is_optimizing(&self) -> bool {
        self.optimizing.load(Ordering::SeqCst)
    }

    pub(crate) fn set_optimizing(&self, value: bool) {
        self.optimizing.store(value, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_replaces_snapshot() {
        let shared = SharedState::new();
        assert_eq!(shared.snapshot(), MapSnapshot::default());

        let snapshot = MapSnapshot {
            origin: Some(MarkerId(3)),
            markers: BTreeMap::from([(MarkerId(3), Extrinsics::identity())]),
            frame_id: Some(FrameId(9)),
            ..Default::default()
        };
        shared.publish(snapshot.clone());
        assert_eq!(shared.snapshot(), snapshot);
        assert_eq!(shared.with_snapshot(|s| s.markers.len()), 1);
    }

    #[test]
    fn test_readers_on_other_threads() {
        let shared = SharedState::new();
        shared.set_optimizing(true);
        let reader = Arc::clone(&shared);
        let seen = std::thread::spawn(move || reader.is_optimizing()).join().unwrap();
        assert!(seen);
    }
}
