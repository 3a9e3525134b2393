//! Two-view linear triangulation and closed-form rigid alignment.

use nalgebra::{Matrix3, Matrix3x4, Matrix4, Vector2, Vector3};

use super::Extrinsics;

/// Rigid transform from a source point set onto a target point set.
#[derive(Debug, Clone, Copy)]
pub struct RigidFit {
    /// Maps source points onto target points.
    pub extrinsics: Extrinsics,
    /// Root-mean-square residual distance after alignment.
    pub rms: f64,
}

/// `[R | t]` for world→camera extrinsics.
pub fn projection_matrix(extrinsics: &Extrinsics) -> Matrix3x4<f64> {
    let r = extrinsics.rotation_matrix();
    let t = extrinsics.translation;
    #[rustfmt::skip]
    let p = Matrix3x4::new(
        r[(0, 0)], r[(0, 1)], r[(0, 2)], t.x,
        r[(1, 0)], r[(1, 1)], r[(1, 2)], t.y,
        r[(2, 0)], r[(2, 1)], r[(2, 2)], t.z,
    );
    p
}

/// DLT triangulation of one point seen by two cameras.
///
/// `na` / `nb` are undistorted normalized image coordinates (z = 1 plane) in
/// the cameras with world→camera extrinsics `pose_a` / `pose_b`.
pub fn triangulate_point(
    pose_a: &Extrinsics,
    na: &Vector2<f64>,
    pose_b: &Extrinsics,
    nb: &Vector2<f64>,
) -> Option<Vector3<f64>> {
    let pa = projection_matrix(pose_a);
    let pb = projection_matrix(pose_b);

    let mut a = Matrix4::zeros();
    a.set_row(0, &(na.x * pa.row(2) - pa.row(0)));
    a.set_row(1, &(na.y * pa.row(2) - pa.row(1)));
    a.set_row(2, &(nb.x * pb.row(2) - pb.row(0)));
    a.set_row(3, &(nb.y * pb.row(2) - pb.row(1)));

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let x_h = v_t.row(min_idx);

    let w = x_h[3];
    if w.abs() <= f64::EPSILON {
        return None;
    }
    let p = Vector3::new(x_h[0] / w, x_h[1] / w, x_h[2] / w);
    (p.iter().all(|v| v.is_finite())).then_some(p)
}

/// Closed-form rigid alignment (no scale) using the SVD of the
/// cross-covariance matrix, with a reflection fix.
///
/// Needs at least three non-collinear points.
pub fn rigid_fit(source: &[Vector3<f64>], target: &[Vector3<f64>]) -> Option<RigidFit> {
    let n = source.len();
    if n < 3 || target.len() != n {
        return None;
    }

    let c_src = centroid(source);
    let c_dst = centroid(target);

    let mut h = Matrix3::zeros();
    for (s, d) in source.iter().zip(target) {
        h += (s - c_src) * (d - c_dst).transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    let mut r = v_t.transpose() * u.transpose();
    if r.determinant() < 0.0 {
        let mut v = v_t.transpose();
        v.column_mut(2).neg_mut();
        r = v * u.transpose();
    }
    let t = c_dst - r * c_src;

    let sq: f64 = source
        .iter()
        .zip(target)
        .map(|(s, d)| (r * s + t - d).norm_squared())
        .sum();
    let rms = (sq / n as f64).sqrt();

    let extrinsics = Extrinsics::from_rotation_translation(&r, t);
    (extrinsics.is_finite() && rms.is_finite()).then_some(RigidFit { extrinsics, rms })
}

fn centroid(points: &[Vector3<f64>]) -> Vector3<f64> {
    let sum: Vector3<f64> = points.iter().sum();
    sum / points.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{marker_corners, marker_points_world};
    use approx::assert_relative_eq;

    fn normalized(pose: &Extrinsics, p: &Vector3<f64>) -> Vector2<f64> {
        let c = pose.transform_point(p);
        Vector2::new(c.x / c.z, c.y / c.z)
    }

    #[test]
    fn test_triangulate_two_views() {
        let a = Extrinsics::from_array([0.0, 0.0, 0.0, 0.0, 0.0, 5.0]);
        let b = Extrinsics::from_array([0.0, -0.2, 0.0, -1.0, 0.0, 5.0]);
        let p = Vector3::new(0.3, -0.4, 0.7);

        let x = triangulate_point(&a, &normalized(&a, &p), &b, &normalized(&b, &p)).unwrap();
        assert_relative_eq!(x, p, epsilon = 1e-9);
    }

    #[test]
    fn test_rigid_fit_recovers_marker() {
        let truth = Extrinsics::from_array([0.1, 0.3, -0.2, 2.0, 1.0, 0.5]);
        let source = marker_corners();
        let target = marker_points_world(&truth);

        let fit = rigid_fit(&source, &target).unwrap();
        assert!(fit.rms < 1e-10);
        assert_relative_eq!(fit.extrinsics.rotation, truth.rotation, epsilon = 1e-9);
        assert_relative_eq!(fit.extrinsics.translation, truth.translation, epsilon = 1e-9);
    }

    #[test]
    fn test_triangulate_then_fit_round_trip() {
        let truth = Extrinsics::from_array([0.05, -0.1, 0.2, 1.5, 0.5, 0.2]);
        let a = Extrinsics::from_array([0.02, 0.0, 0.0, -0.5, -0.5, 6.0]);
        let b = Extrinsics::from_array([0.0, 0.25, 0.05, -2.5, -0.5, 6.5]);
        let world = marker_points_world(&truth);

        let triangulated: Vec<_> = world
            .iter()
            .map(|p| triangulate_point(&a, &normalized(&a, p), &b, &normalized(&b, p)).unwrap())
            .collect();
        let fit = rigid_fit(&marker_corners(), &triangulated).unwrap();

        assert!(fit.extrinsics.max_abs_diff(&truth) < 1e-3);
    }

    #[test]
    fn test_rigid_fit_needs_three_points() {
        let pts = [Vector3::zeros(), Vector3::x()];
        assert!(rigid_fit(&pts, &pts).is_none());
    }
}
