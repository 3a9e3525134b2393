//! Bootstraps unknown camera and marker poses from known ones.
//!
//! Cameras are located by PnP against markers already in the map, markers by
//! triangulating their corners from two located cameras and fitting the
//! canonical square onto the result. Both steps feed each other, so the whole
//! sequence is repeated for a configurable number of passes.

use std::collections::BTreeMap;

use nalgebra::Vector3;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::camera::CameraModel;
use crate::geometry::homography::square_pose;
use crate::geometry::{
    is_plausible_pose, marker_corners, marker_points_world, rigid_fit, solve_pnp,
    triangulate_point, Extrinsics,
};
use crate::markers::{FrameId, KeyMarker, MarkerId};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct InitialGuessConfig {
    /// Camera pass + marker pass repetitions.
    pub passes: usize,
    /// Largest accepted RMS of the square fit, in marker units.
    pub max_fit_rms: f64,
    /// Largest accepted `|edge length - 1|` of a triangulated square.
    pub max_edge_length_deviation: f64,
    /// Locate markers seen by a single known camera from that view alone.
    pub single_view_markers: bool,
}

impl Default for InitialGuessConfig {
    fn default() -> Self {
        Self {
            passes: 2,
            max_fit_rms: 0.1,
            max_edge_length_deviation: 0.3,
            single_view_markers: true,
        }
    }
}

/// Extended pose maps produced by [`InitialGuessEstimator::estimate`].
#[derive(Debug, Clone)]
pub struct InitialGuess {
    pub frames: BTreeMap<FrameId, Extrinsics>,
    pub markers: BTreeMap<MarkerId, Extrinsics>,
    pub new_frames: usize,
    pub new_markers: usize,
}

#[derive(Debug, Clone, Default)]
pub struct InitialGuessEstimator {
    config: InitialGuessConfig,
}

impl InitialGuessEstimator {
    pub fn new(config: InitialGuessConfig) -> Self {
        Self { config }
    }

    /// Extends `frames` and `markers` using `observations`.
    ///
    /// Returns `None` when no new pose could be established.
    pub fn estimate(
        &self,
        frames: &BTreeMap<FrameId, Extrinsics>,
        markers: &BTreeMap<MarkerId, Extrinsics>,
        observations: &[KeyMarker],
        camera: &CameraModel,
    ) -> Option<InitialGuess> {
        let mut by_frame: BTreeMap<FrameId, Vec<&KeyMarker>> = BTreeMap::new();
        let mut by_marker: BTreeMap<MarkerId, Vec<&KeyMarker>> = BTreeMap::new();
        for km in observations {
            by_frame.entry(km.frame_id).or_default().push(km);
            by_marker.entry(km.marker_id).or_default().push(km);
        }

        let mut guess = InitialGuess {
            frames: frames.clone(),
            markers: markers.clone(),
            new_frames: 0,
            new_markers: 0,
        };

        for pass in 0..self.config.passes.max(1) {
            let located = self.locate_cameras(&by_frame, &mut guess, camera);
            let placed = self.locate_markers(&by_marker, &mut guess, camera);
            trace!("initial guess pass {}: {} cameras, {} markers", pass, located, placed);
            if located + placed == 0 {
                break;
            }
        }

        debug!(
            "initial guess: {} new frames, {} new markers",
            guess.new_frames, guess.new_markers
        );
        (guess.new_frames + guess.new_markers > 0).then_some(guess)
    }

    fn locate_cameras(
        &self,
        by_frame: &BTreeMap<FrameId, Vec<&KeyMarker>>,
        guess: &mut InitialGuess,
        camera: &CameraModel,
    ) -> usize {
        let mut located = 0;
        for (&frame_id, kms) in by_frame {
            if guess.frames.contains_key(&frame_id) {
                continue;
            }
            let mut points3d = Vec::new();
            let mut points2d = Vec::new();
            for km in kms {
                if let Some(marker) = guess.markers.get(&km.marker_id) {
                    points3d.extend(marker_points_world(marker));
                    points2d.extend(km.verts);
                }
            }
            if points3d.is_empty() {
                continue;
            }

            match solve_pnp(&points3d, &points2d, camera, None) {
                Some(pose) if is_plausible_pose(&pose, &points3d) => {
                    guess.frames.insert(frame_id, pose);
                    guess.new_frames += 1;
                    located += 1;
                }
                _ => trace!("{}: no plausible PnP solution", frame_id),
            }
        }
        located
    }

    fn locate_markers(
        &self,
        by_marker: &BTreeMap<MarkerId, Vec<&KeyMarker>>,
        guess: &mut InitialGuess,
        camera: &CameraModel,
    ) -> usize {
        let mut placed = 0;
        for (&marker_id, kms) in by_marker {
            if guess.markers.contains_key(&marker_id) {
                continue;
            }
            let views: Vec<(&Extrinsics, &KeyMarker)> = kms
                .iter()
                .filter_map(|km| guess.frames.get(&km.frame_id).map(|pose| (pose, *km)))
                .collect();

            let estimate = match views.len() {
                0 => None,
                1 if self.config.single_view_markers => {
                    single_view_marker(views[0].0, views[0].1, camera)
                }
                1 => None,
                _ => self.triangulate_marker(&views, camera),
            };

            match estimate {
                Some(pose) => {
                    guess.markers.insert(marker_id, pose);
                    guess.new_markers += 1;
                    placed += 1;
                }
                None => trace!("{}: could not be placed from {} views", marker_id, views.len()),
            }
        }
        placed
    }

    /// Triangulates from the two views with the widest baseline.
    fn triangulate_marker(
        &self,
        views: &[(&Extrinsics, &KeyMarker)],
        camera: &CameraModel,
    ) -> Option<Extrinsics> {
        let centers: Vec<Vector3<f64>> =
            views.iter().map(|(pose, _)| pose.camera_center()).collect();
        let mut best = (0, 1, -1.0);
        for i in 0..views.len() {
            for j in i + 1..views.len() {
                let d = (centers[i] - centers[j]).norm();
                if d > best.2 {
                    best = (i, j, d);
                }
            }
        }
        let (a, b, baseline) = best;
        if baseline <= f64::EPSILON {
            return None;
        }
        let (pose_a, km_a) = views[a];
        let (pose_b, km_b) = views[b];

        let na = camera.undistort_points(&km_a.verts);
        let nb = camera.undistort_points(&km_b.verts);
        let points: Vec<Vector3<f64>> = na
            .iter()
            .zip(&nb)
            .map(|(pa, pb)| triangulate_point(pose_a, pa, pose_b, pb))
            .collect::<Option<_>>()?;

        // Triangulated corners must be in front of both cameras.
        let in_front = |pose: &Extrinsics| points.iter().all(|p| pose.transform_point(p).z > 0.0);
        if !in_front(pose_a) || !in_front(pose_b) {
            return None;
        }

        let max_dev = (0..4)
            .map(|i| ((points[(i + 1) % 4] - points[i]).norm() - 1.0).abs())
            .fold(0.0, f64::max);
        if max_dev > self.config.max_edge_length_deviation {
            trace!("triangulated square edge deviates by {:.3}", max_dev);
            return None;
        }

        let fit = rigid_fit(&marker_corners(), &points)?;
        if fit.rms > self.config.max_fit_rms {
            trace!("square fit rms {:.3} above tolerance", fit.rms);
            return None;
        }
        Some(fit.extrinsics)
    }
}

/// Marker pose from a single located view via the planar square pose.
fn single_view_marker(
    camera_pose: &Extrinsics,
    km: &KeyMarker,
    camera: &CameraModel,
) -> Option<Extrinsics> {
    let normalized = camera.undistort_points(&km.verts);
    let marker_to_camera = square_pose(&normalized)?;
    if !is_plausible_pose(&marker_to_camera, &marker_corners()) {
        return None;
    }
    let marker = camera_pose.inverse().compose(&marker_to_camera);
    marker.is_finite().then_some(marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::pnp::reprojection_error;
    use crate::optimizer::{solve_bundle, BundleAdjustmentConfig, BundleProblem};
    use crate::testing::SyntheticScene;
    use approx::assert_relative_eq;

    #[test]
    fn test_scenario_b_single_view() {
        let scene = SyntheticScene::new();
        let origin = scene.marker(1);
        let frame_a = scene.camera_pose(0);
        let frame_b = scene.camera_pose(1);
        let observations = vec![
            scene.key_marker(0, 1, &frame_a),
            scene.key_marker(1, 1, &frame_b),
            scene.key_marker(1, 2, &frame_b),
        ];

        let markers = BTreeMap::from([(MarkerId(1), origin)]);
        let guess = InitialGuessEstimator::default()
            .estimate(&BTreeMap::new(), &markers, &observations, &scene.camera)
            .unwrap();

        assert_eq!(guess.new_frames, 2);
        assert_eq!(guess.new_markers, 1);
        let m2 = guess.markers[&MarkerId(2)];
        assert!(m2.max_abs_diff(&scene.marker(2)) < 1e-5);
        assert!(guess.frames[&FrameId(1)].max_abs_diff(&frame_b) < 1e-5);

        let problem = BundleProblem {
            frames: guess.frames,
            markers: guess.markers,
            origin: MarkerId(1),
            observations: observations.clone(),
            camera: scene.camera.clone(),
            refine_intrinsics: false,
        };
        let result = solve_bundle(&problem, &BundleAdjustmentConfig::default(), &|| false).unwrap();
        assert!(result.failed_pairs.is_empty());

        let solved_b = result.frames[&FrameId(1)];
        let corners = marker_points_world(&result.markers[&MarkerId(2)]);
        let mean_error =
            reprojection_error(&corners, &observations[2].verts, &scene.camera, &solved_b) / 4.0;
        assert!(mean_error < 1.0, "marker 2 reprojects {} px off", mean_error);
    }

    #[test]
    fn test_two_view_triangulation() {
        let scene = SyntheticScene::new();
        let poses = [scene.camera_pose(0), scene.camera_pose(3)];
        let frames: BTreeMap<_, _> = [(FrameId(0), poses[0]), (FrameId(3), poses[1])].into();
        let observations = vec![
            scene.key_marker(0, 2, &poses[0]),
            scene.key_marker(3, 2, &poses[1]),
        ];

        let estimator = InitialGuessEstimator::new(InitialGuessConfig {
            single_view_markers: false,
            ..Default::default()
        });
        let guess = estimator
            .estimate(&frames, &BTreeMap::new(), &observations, &scene.camera)
            .unwrap();

        let m2 = guess.markers[&MarkerId(2)];
        assert_relative_eq!(m2.translation, scene.marker(2).translation, epsilon = 1e-3);
        assert!(m2.max_abs_diff(&scene.marker(2)) < 1e-3);
    }

    #[test]
    fn test_nothing_new_returns_none() {
        let scene = SyntheticScene::new();
        let pose = scene.camera_pose(0);
        // Marker 3 is seen only by an unknown frame and nothing is known.
        let observations = vec![scene.key_marker(0, 3, &pose)];
        let result = InitialGuessEstimator::default().estimate(
            &BTreeMap::new(),
            &BTreeMap::new(),
            &observations,
            &scene.camera,
        );
        assert!(result.is_none());
    }
}
