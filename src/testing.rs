//! Synthetic marker scene shared by the unit tests.

use std::collections::BTreeMap;

use nalgebra::{Vector2, Vector3};

use crate::camera::CameraModel;
use crate::geometry::{marker_points_world, so3, Extrinsics};
use crate::markers::{Detection, FrameId, KeyMarker, MarkerId};

/// Four markers near the `z = 0` plane watched by cameras about seven
/// units away, looking along `+z`.
pub struct SyntheticScene {
    pub camera: CameraModel,
    markers: BTreeMap<MarkerId, Extrinsics>,
}

impl SyntheticScene {
    pub fn new() -> Self {
        let camera = CameraModel::new(800.0, 800.0, 640.0, 360.0, 1280, 720)
            .with_distortion([0.05, -0.01, 0.001, -0.001, 0.0]);
        let markers = BTreeMap::from([
            (MarkerId(1), Extrinsics::identity()),
            (MarkerId(2), Extrinsics::from_array([0.0, 0.1, 0.0, 2.0, 0.0, 0.0])),
            (MarkerId(3), Extrinsics::from_array([0.1, 0.0, 0.05, 0.0, 2.0, 0.0])),
            (MarkerId(4), Extrinsics::from_array([-0.1, 0.15, 0.0, 2.0, 2.0, 0.3])),
        ]);
        Self { camera, markers }
    }

    pub fn marker(&self, id: u32) -> Extrinsics {
        self.markers[&MarkerId(id)]
    }

    pub fn markers(&self) -> BTreeMap<MarkerId, Extrinsics> {
        self.markers.clone()
    }

    pub fn marker_ids(&self) -> Vec<u32> {
        self.markers.keys().map(|m| m.0).collect()
    }

    /// World→camera pose of the `i`-th camera on a 4×3 grid of centres.
    pub fn camera_pose(&self, i: usize) -> Extrinsics {
        let center = Vector3::new(
            0.5 + (i % 4) as f64,
            0.5 + ((i / 4) % 3) as f64,
            -7.0 + 0.2 * (i % 3) as f64 - 0.1 * (i / 12) as f64,
        );
        let rvec = Vector3::new(
            0.02 * (i % 3) as f64 - 0.02,
            0.03 * (i % 2) as f64 - 0.015,
            0.01 * (i % 5) as f64 - 0.02,
        );
        let r = so3::exp(&rvec);
        Extrinsics::from_rotation_translation(&r, -(r * center))
    }

    /// Noiseless corner pixels of marker `id` seen from `pose`.
    pub fn project(&self, id: u32, pose: &Extrinsics) -> [Vector2<f64>; 4] {
        let points = marker_points_world(&self.marker(id));
        let uv = self.camera.project_points(&points, pose);
        [uv[0], uv[1], uv[2], uv[3]]
    }

    pub fn key_marker(&self, frame: u64, id: u32, pose: &Extrinsics) -> KeyMarker {
        KeyMarker {
            frame_id: FrameId(frame),
            marker_id: MarkerId(id),
            verts: self.project(id, pose),
            bin: (0, 0),
        }
    }

    pub fn detection(&self, frame: u64, id: u32, pose: &Extrinsics) -> Detection {
        Detection::new(
            FrameId(frame),
            MarkerId(id),
            frame as f64 / 30.0,
            self.project(id, pose),
            (self.camera.width, self.camera.height),
        )
    }

    /// Detections of `ids` in frame `frame` taken from camera `i`.
    pub fn detections(&self, frame: u64, camera: usize, ids: &[u32]) -> Vec<Detection> {
        let pose = self.camera_pose(camera);
        ids.iter().map(|&id| self.detection(frame, id, &pose)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_marker_visible_from_every_camera() {
        let scene = SyntheticScene::new();
        for i in 0..24 {
            let pose = scene.camera_pose(i);
            for id in scene.marker_ids() {
                for uv in scene.project(id, &pose) {
                    assert!(uv.x > 0.0 && uv.x < 1280.0 && uv.y > 0.0 && uv.y < 720.0);
                }
            }
        }
    }
}
