//! Plane-to-image homographies and planar pose recovery.
//!
//! Used to seed PnP from a single marker: the four canonical corners lie in
//! the plane `z = 0`, so their undistorted normalized projections are related
//! to the marker-local coordinates by a homography `H = [r1 r2 t]` up to scale.

use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};

use super::Extrinsics;

/// Estimates `H` such that `image ~ H · plane` with the direct linear transform.
///
/// Needs at least four correspondences. Returns `None` on degenerate input.
pub fn dlt_homography(plane: &[Vector2<f64>], image: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    let n = plane.len();
    if n < 4 || image.len() != n {
        return None;
    }

    // At least 9 rows so the SVD exposes the full right null space.
    let rows = (2 * n).max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);

    for (i, (pw, pi)) in plane.iter().zip(image.iter()).enumerate() {
        let (x, y) = (pw.x, pw.y);
        let (u, v) = (pi.x, pi.y);
        let r0 = 2 * i;
        let r1 = r0 + 1;

        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let h = v_t.row(min_idx);

    let mut h_mat = Matrix3::zeros();
    for r in 0..3 {
        for c in 0..3 {
            h_mat[(r, c)] = h[3 * r + c];
        }
    }

    let scale = h_mat[(2, 2)];
    if scale.abs() > f64::EPSILON {
        h_mat /= scale;
    }
    h_mat.iter().all(|v| v.is_finite()).then_some(h_mat)
}

/// Decomposes a homography from plane coordinates to undistorted normalized
/// image coordinates into plane→camera extrinsics.
///
/// The sign is chosen so the plane lies in front of the camera.
pub fn planar_pose_from_homography(h: &Matrix3<f64>) -> Option<Extrinsics> {
    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();

    let norm = 0.5 * (h1.norm() + h2.norm());
    if norm < 1e-12 {
        return None;
    }
    let mut lambda = 1.0 / norm;
    if h3.z * lambda < 0.0 {
        lambda = -lambda;
    }

    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let r3 = r1.cross(&r2);
    let r = Matrix3::from_columns(&[r1, r2, r3]);

    // Project onto SO(3).
    let svd = r.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut r_orth = u * v_t;
    if r_orth.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r_orth = u_flipped * v_t;
    }

    let t: Vector3<f64> = h3 * lambda;
    let pose = Extrinsics::from_rotation_translation(&r_orth, t);
    pose.is_finite().then_some(pose)
}

/// Pose of a unit square (canonical marker corners) from its four undistorted
/// normalized image corners. Maps marker-local points into the camera frame.
pub fn square_pose(normalized: &[Vector2<f64>]) -> Option<Extrinsics> {
    if normalized.len() != 4 {
        return None;
    }
    let plane = [
        Vector2::new(0.0, 0.0),
        Vector2::new(1.0, 0.0),
        Vector2::new(1.0, 1.0),
        Vector2::new(0.0, 1.0),
    ];
    let h = dlt_homography(&plane, normalized)?;
    planar_pose_from_homography(&h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::marker_corners;
    use approx::assert_relative_eq;

    #[test]
    fn test_scaling_homography() {
        let w = [
            Vector2::new(0.0, 0.0),
            Vector2::new(1.0, 0.0),
            Vector2::new(1.0, 1.0),
            Vector2::new(0.0, 1.0),
        ];
        let img: Vec<_> = w.iter().map(|p| p * 2.0 + Vector2::new(1.0, -1.0)).collect();

        let h = dlt_homography(&w, &img).unwrap();
        assert_relative_eq!(h[(0, 0)], 2.0, epsilon = 1e-9);
        assert_relative_eq!(h[(1, 2)], -1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_square_pose_recovers_pose() {
        let truth = Extrinsics::from_array([0.2, -0.15, 0.3, -0.4, 0.1, 4.0]);
        let normalized: Vec<_> = marker_corners()
            .iter()
            .map(|c| {
                let p = truth.transform_point(c);
                Vector2::new(p.x / p.z, p.y / p.z)
            })
            .collect();

        let pose = square_pose(&normalized).unwrap();
        assert_relative_eq!(pose.rotation, truth.rotation, epsilon = 1e-8);
        assert_relative_eq!(pose.translation, truth.translation, epsilon = 1e-8);
    }

    #[test]
    fn test_too_few_points() {
        let w = [Vector2::new(0.0, 0.0); 3];
        assert!(dlt_homography(&w, &w).is_none());
    }
}
