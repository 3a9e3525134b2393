//! PnP (Perspective-n-Point) for marker corners.
//!
//! Correspondences come in groups of four coplanar points (one marker's
//! corners). Without a prior, every group yields a candidate pose from its
//! plane homography; the candidate with the lowest reprojection error over all
//! points is refined with Levenberg-Marquardt.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use nalgebra::{DMatrix, DVector, Dyn, Matrix3, Owned, Vector2, Vector3};
use tracing::trace;

use super::{homography, Extrinsics};
use crate::camera::CameraModel;

/// Central-difference step for the numerical Jacobian.
const JACOBIAN_STEP: f64 = 1e-6;

/// Largest rotation magnitude accepted for a pose, in radians.
pub const MAX_ROTATION_NORM: f64 = 2.0 * std::f64::consts::PI;

/// Solves world→camera extrinsics from 3D↔2D correspondences.
///
/// `points2d` are distorted pixels. When `guess` is given it seeds the
/// refinement, otherwise a planar initialisation is used.
pub fn solve_pnp(
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    camera: &CameraModel,
    guess: Option<&Extrinsics>,
) -> Option<Extrinsics> {
    if points3d.len() < 4 || points3d.len() != points2d.len() {
        return None;
    }

    let initial = match guess {
        Some(g) if g.is_finite() => *g,
        _ => planar_initial_pose(points3d, points2d, camera)?,
    };

    let problem = PnpProblem {
        points3d,
        points2d,
        camera,
        params: DVector::from_row_slice(&initial.to_array()),
    };
    let initial_cost = problem.cost();

    let (problem, report) = LevenbergMarquardt::new().minimize(problem);
    let refined = Extrinsics::from_slice(problem.params.as_slice(), 0);
    accept_refinement(
        initial,
        refined,
        (initial_cost, problem.cost()),
        &report.termination,
    )
}

/// Keeps a converged refinement unless it made the fit worse.
fn accept_refinement(
    initial: Extrinsics,
    refined: Extrinsics,
    (initial_cost, final_cost): (f64, f64),
    termination: &TerminationReason,
) -> Option<Extrinsics> {
    if !termination.was_successful() {
        trace!("PnP refinement did not converge: {:?}", termination);
        return None;
    }
    if !refined.is_finite() || !final_cost.is_finite() {
        return None;
    }
    if final_cost > initial_cost {
        return Some(initial);
    }
    Some(refined)
}

/// Rejects poses with a wrapped-around rotation or points behind the camera.
pub fn is_plausible_pose(extrinsics: &Extrinsics, points3d: &[Vector3<f64>]) -> bool {
    if !extrinsics.is_finite() || extrinsics.rotation.norm() > MAX_ROTATION_NORM {
        return false;
    }
    let r = extrinsics.rotation_matrix();
    points3d
        .iter()
        .all(|p| (r * p + extrinsics.translation).z > 0.0)
}

/// Sum of pixel distances between projected and observed points.
pub fn reprojection_error(
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    camera: &CameraModel,
    extrinsics: &Extrinsics,
) -> f64 {
    camera
        .project_points(points3d, extrinsics)
        .iter()
        .zip(points2d)
        .map(|(p, o)| (p - o).norm())
        .sum()
}

/// Best planar candidate among all four-point groups.
fn planar_initial_pose(
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    camera: &CameraModel,
) -> Option<Extrinsics> {
    points3d
        .chunks_exact(4)
        .zip(points2d.chunks_exact(4))
        .filter_map(|(p3, p2)| planar_pose(p3, p2, camera))
        .filter(|pose| is_plausible_pose(pose, points3d))
        .map(|pose| (reprojection_error(points3d, points2d, camera, &pose), pose))
        .filter(|(err, _)| err.is_finite())
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, pose)| pose)
}

/// Pose from four coplanar world points via the plane homography.
fn planar_pose(
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    camera: &CameraModel,
) -> Option<Extrinsics> {
    // Orthonormal frame spanning the plane, anchored at the first point.
    let origin = points3d[0];
    let ex = (points3d[1] - origin).try_normalize(1e-12)?;
    let ez = ex.cross(&(points3d[3] - origin)).try_normalize(1e-12)?;
    let ey = ez.cross(&ex);

    let plane: Vec<Vector2<f64>> = points3d
        .iter()
        .map(|p| {
            let d = p - origin;
            Vector2::new(d.dot(&ex), d.dot(&ey))
        })
        .collect();
    let normalized = camera.undistort_points(points2d);

    let h = homography::dlt_homography(&plane, &normalized)?;
    let plane_to_camera = homography::planar_pose_from_homography(&h)?;

    let r_world_to_plane = Matrix3::from_rows(&[ex.transpose(), ey.transpose(), ez.transpose()]);
    let world_to_plane =
        Extrinsics::from_rotation_translation(&r_world_to_plane, -(r_world_to_plane * origin));

    Some(plane_to_camera.compose(&world_to_plane))
}

struct PnpProblem<'a> {
    points3d: &'a [Vector3<f64>],
    points2d: &'a [Vector2<f64>],
    camera: &'a CameraModel,
    params: DVector<f64>,
}

impl PnpProblem<'_> {
    fn residuals_at(&self, params: &[f64]) -> DVector<f64> {
        let pose = Extrinsics::from_slice(params, 0);
        let projected = self.camera.project_points(self.points3d, &pose);
        let mut r = DVector::zeros(self.points2d.len() * 2);
        for (i, (p, o)) in projected.iter().zip(self.points2d).enumerate() {
            r[2 * i] = p.x - o.x;
            r[2 * i + 1] = p.y - o.y;
        }
        r
    }

    fn cost(&self) -> f64 {
        0.5 * self.residuals_at(self.params.as_slice()).norm_squared()
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for PnpProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, params: &DVector<f64>) {
        self.params.copy_from(params);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let r = self.residuals_at(self.params.as_slice());
        r.iter().all(|v| v.is_finite()).then_some(r)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let n = self.points2d.len() * 2;
        let mut jac = DMatrix::zeros(n, 6);
        let mut p = self.params.as_slice().to_vec();
        for k in 0..6 {
            let orig = p[k];
            p[k] = orig + JACOBIAN_STEP;
            let plus = self.residuals_at(&p);
            p[k] = orig - JACOBIAN_STEP;
            let minus = self.residuals_at(&p);
            p[k] = orig;
            jac.set_column(k, &((plus - minus) / (2.0 * JACOBIAN_STEP)));
        }
        jac.iter().all(|v| v.is_finite()).then_some(jac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::marker_points_world;
    use approx::assert_relative_eq;

    fn camera() -> CameraModel {
        CameraModel::new(800.0, 800.0, 640.0, 360.0, 1280, 720)
            .with_distortion([0.05, -0.01, 0.001, -0.001, 0.0])
    }

    fn scene() -> Vec<Vector3<f64>> {
        let mut pts = Vec::new();
        pts.extend(marker_points_world(&Extrinsics::identity()));
        pts.extend(marker_points_world(&Extrinsics::from_array([
            0.0, 0.2, 0.0, 2.0, 0.0, 0.1,
        ])));
        pts
    }

    #[test]
    fn test_solve_pnp_without_guess() {
        let cam = camera();
        let truth = Extrinsics::from_array([0.05, -0.1, 0.02, -1.2, -0.4, 6.0]);
        let points3d = scene();
        let points2d = cam.project_points(&points3d, &truth);

        let pose = solve_pnp(&points3d, &points2d, &cam, None).unwrap();
        assert_relative_eq!(pose.rotation, truth.rotation, epsilon = 1e-6);
        assert_relative_eq!(pose.translation, truth.translation, epsilon = 1e-5);
    }

    #[test]
    fn test_solve_pnp_with_guess() {
        let cam = camera();
        let truth = Extrinsics::from_array([0.05, -0.1, 0.02, -1.2, -0.4, 6.0]);
        let guess = Extrinsics::from_array([0.0, -0.05, 0.0, -1.0, -0.3, 5.5]);
        let points3d = scene();
        let points2d = cam.project_points(&points3d, &truth);

        let pose = solve_pnp(&points3d, &points2d, &cam, Some(&guess)).unwrap();
        assert!(reprojection_error(&points3d, &points2d, &cam, &pose) < 1e-4);
    }

    #[test]
    fn test_rejects_mismatched_input() {
        let cam = camera();
        let points3d = scene();
        let points2d = vec![Vector2::zeros(); 3];
        assert!(solve_pnp(&points3d, &points2d, &cam, None).is_none());
    }

    #[test]
    fn test_refinement_acceptance() {
        let initial = Extrinsics::from_array([0.0, 0.0, 0.0, 0.0, 0.0, 5.0]);
        let refined = Extrinsics::from_array([0.01, 0.0, 0.0, 0.0, 0.0, 5.0]);
        let converged = TerminationReason::Converged {
            ftol: true,
            xtol: false,
        };

        assert_eq!(
            accept_refinement(initial, refined, (2.0, 1.0), &converged),
            Some(refined)
        );
        assert_eq!(
            accept_refinement(initial, refined, (1.0, 2.0), &converged),
            Some(initial)
        );
        assert_eq!(
            accept_refinement(initial, refined, (2.0, 1.0), &TerminationReason::LostPatience),
            None
        );
    }

    #[test]
    fn test_plausibility() {
        let points = scene();
        let front = Extrinsics::from_array([0.0, 0.0, 0.0, 0.0, 0.0, 5.0]);
        let behind = Extrinsics::from_array([0.0, 0.0, 0.0, 0.0, 0.0, -5.0]);
        let wrapped = Extrinsics::from_array([7.0, 0.0, 0.0, 0.0, 0.0, 5.0]);

        assert!(is_plausible_pose(&front, &points));
        assert!(!is_plausible_pose(&behind, &points));
        assert!(!is_plausible_pose(&wrapped, &points));
    }
}
