//! Camera localization against mapped markers.
//!
//! Each frame is solved with PnP over the corners of every visible marker that
//! already has a pose. The last accepted pose seeds the next solve and bounds
//! how far the camera may move; a run of rejected frames drops the prior so a
//! stale pose cannot lock the localizer out.

use std::collections::BTreeMap;

use nalgebra::{Matrix4, Vector2, Vector3};
use serde::Deserialize;
use tracing::{debug, warn};

use super::result::{Localization, LocalizationFailure};
use super::state::LocalizerState;
use crate::camera::CameraModel;
use crate::geometry::{is_plausible_pose, marker_points_world, solve_pnp, Extrinsics};
use crate::markers::{Detection, MarkerId};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CameraLocalizerConfig {
    /// Mapped markers required in view.
    pub min_markers: usize,
    /// Largest accepted camera-centre displacement from the prior, in marker units.
    pub max_step: f64,
    /// Consecutive failures after which the prior is dropped.
    pub max_failure_streak: usize,
}

impl Default for CameraLocalizerConfig {
    fn default() -> Self {
        Self {
            min_markers: 1,
            max_step: 5.0,
            max_failure_streak: 3,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CameraLocalizer {
    config: CameraLocalizerConfig,
    state: LocalizerState,
    prior: Option<Extrinsics>,
    failure_streak: usize,
}

impl CameraLocalizer {
    pub fn new(config: CameraLocalizerConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn state(&self) -> LocalizerState {
        self.state
    }

    /// Last accepted world→camera pose.
    pub fn prior(&self) -> Option<&Extrinsics> {
        self.prior.as_ref()
    }

    pub fn failure_streak(&self) -> usize {
        self.failure_streak
    }

    /// Camera→world transform of the last accepted pose.
    pub fn pose_matrix(&self) -> Option<Matrix4<f64>> {
        self.prior.map(|p| p.inverse().to_matrix())
    }

    /// Localizes one frame.
    ///
    /// Frames with too few mapped markers leave the state untouched; every
    /// other failure counts towards the failure streak.
    pub fn localize(
        &mut self,
        detections: &[Detection],
        markers: &BTreeMap<MarkerId, Extrinsics>,
        camera: &CameraModel,
    ) -> Localization {
        let mut points3d: Vec<Vector3<f64>> = Vec::new();
        let mut points2d: Vec<Vector2<f64>> = Vec::new();
        let mut used = 0;
        for det in detections {
            if let Some(marker) = markers.get(&det.marker_id) {
                points3d.extend(marker_points_world(marker));
                points2d.extend(det.verts);
                used += 1;
            }
        }

        if used == 0 || used < self.config.min_markers {
            return Localization::NotLocalized(LocalizationFailure::TooFewMarkers {
                found: used,
                required: self.config.min_markers.max(1),
            });
        }

        let guess = match self.state {
            LocalizerState::HasPrior => self.prior,
            LocalizerState::NoPrior => None,
        };

        let Some(pose) = solve_pnp(&points3d, &points2d, camera, guess.as_ref()) else {
            return self.fail(LocalizationFailure::SolverFailed);
        };
        if !is_plausible_pose(&pose, &points3d) {
            return self.fail(LocalizationFailure::Implausible);
        }
        if let Some(prior) = guess {
            let distance = (pose.camera_center() - prior.camera_center()).norm();
            if distance > self.config.max_step {
                return self.fail(LocalizationFailure::Jump { distance });
            }
        }

        self.state = LocalizerState::HasPrior;
        self.prior = Some(pose);
        self.failure_streak = 0;
        Localization::Localized {
            extrinsics: pose,
            markers_used: used,
        }
    }

    fn fail(&mut self, reason: LocalizationFailure) -> Localization {
        self.failure_streak += 1;
        debug!("localization failed ({}), streak {}", reason, self.failure_streak);
        if self.failure_streak >= self.config.max_failure_streak
            && self.state == LocalizerState::HasPrior
        {
            warn!(
                "dropping camera prior after {} consecutive failures",
                self.failure_streak
            );
            self.state = LocalizerState::NoPrior;
            self.prior = None;
            self.failure_streak = 0;
        }
        Localization::NotLocalized(reason)
    }

    pub fn reset(&mut self) {
        self.state = LocalizerState::NoPrior;
        self.prior = None;
        self.failure_streak = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SyntheticScene;
    use approx::assert_relative_eq;

    #[test]
    fn test_localizes_against_known_map() {
        let scene = SyntheticScene::new();
        let mut localizer = CameraLocalizer::default();
        let truth = scene.camera_pose(5);
        let detections = scene.detections(0, 5, &[1, 2, 3, 4]);

        let result = localizer.localize(&detections, &scene.markers(), &scene.camera);
        match result {
            Localization::Localized {
                extrinsics,
                markers_used,
            } => {
                assert_eq!(markers_used, 4);
                assert!(extrinsics.max_abs_diff(&truth) < 1e-6);
            }
            other => panic!("expected a pose, got {:?}", other),
        }
        assert_eq!(localizer.state(), LocalizerState::HasPrior);
        assert_relative_eq!(
            localizer.pose_matrix().unwrap(),
            truth.inverse().to_matrix(),
            epsilon = 1e-5
        );
    }

    #[test]
    fn test_single_marker_without_model() {
        let scene = SyntheticScene::new();
        let mut localizer = CameraLocalizer::default();
        let detections = scene.detections(0, 0, &[1]);

        let result = localizer.localize(&detections, &BTreeMap::new(), &scene.camera);
        assert_eq!(
            result,
            Localization::NotLocalized(LocalizationFailure::TooFewMarkers {
                found: 0,
                required: 1
            })
        );
        assert!(result.extrinsics().is_none());
        assert_eq!(localizer.state(), LocalizerState::NoPrior);
        assert!(localizer.pose_matrix().is_none());
    }

    #[test]
    fn test_unknown_markers_leave_state_unchanged() {
        let scene = SyntheticScene::new();
        let mut localizer = CameraLocalizer::default();
        let first = scene.detections(0, 0, &[1, 2]);
        assert!(localizer
            .localize(&first, &scene.markers(), &scene.camera)
            .is_localized());

        let mut map = scene.markers();
        map.retain(|id, _| *id == MarkerId(1));
        let unknown = scene.detections(1, 0, &[3]);
        let result = localizer.localize(&unknown, &map, &scene.camera);
        assert_eq!(
            result,
            Localization::NotLocalized(LocalizationFailure::TooFewMarkers {
                found: 0,
                required: 1
            })
        );
        assert_eq!(localizer.state(), LocalizerState::HasPrior);
        assert_eq!(localizer.failure_streak(), 0);
    }

    #[test]
    fn test_jump_rejected_then_prior_dropped() {
        let scene = SyntheticScene::new();
        let mut localizer = CameraLocalizer::new(CameraLocalizerConfig {
            max_step: 0.5,
            ..Default::default()
        });
        let map = scene.markers();
        assert!(localizer
            .localize(&scene.detections(0, 0, &[1, 2, 3, 4]), &map, &scene.camera)
            .is_localized());

        // Camera 3 sits three units to the side of camera 0.
        for frame in 1..=3 {
            let far = scene.detections(frame, 3, &[1, 2, 3, 4]);
            let result = localizer.localize(&far, &map, &scene.camera);
            assert!(matches!(
                result,
                Localization::NotLocalized(LocalizationFailure::Jump { distance }) if distance > 2.0
            ));
        }
        assert_eq!(localizer.state(), LocalizerState::NoPrior);
        assert!(localizer.prior().is_none());

        let again = scene.detections(4, 3, &[1, 2, 3, 4]);
        let result = localizer.localize(&again, &map, &scene.camera);
        let pose = result.extrinsics().copied().unwrap();
        assert!(pose.max_abs_diff(&scene.camera_pose(3)) < 1e-6);
    }

    #[test]
    fn test_reset_clears_prior() {
        let scene = SyntheticScene::new();
        let mut localizer = CameraLocalizer::default();
        localizer.localize(&scene.detections(0, 1, &[1]), &scene.markers(), &scene.camera);
        assert!(localizer.prior().is_some());
        localizer.reset();
        assert_eq!(localizer.state(), LocalizerState::NoPrior);
        assert!(localizer.pose_matrix().is_none());
    }
}
