//! SO(3) helpers for Rodrigues-vector rotations.
//!
//! Extrinsics store rotations as Rodrigues vectors (axis scaled by angle), the
//! same convention OpenCV uses for `rvec`. These helpers convert between that
//! form and rotation matrices.

use nalgebra::{Matrix3, Rotation3, Vector3};

/// Small angle threshold for numerical stability.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-10;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Exponential map: Rodrigues vector to rotation matrix.
///
/// Any magnitude is accepted; angles beyond π wrap around.
pub fn exp(rvec: &Vector3<f64>) -> Matrix3<f64> {
    let theta = rvec.norm();
    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() + skew(rvec);
    }
    let k = skew(&(rvec / theta));
    Matrix3::identity() + theta.sin() * k + (1.0 - theta.cos()) * (k * k)
}

/// Logarithm map: rotation matrix to a Rodrigues vector with norm in [0, π].
///
/// The input is projected onto SO(3) first, so slightly non-orthogonal
/// matrices coming out of linear solvers are fine.
pub fn log(rotation: &Matrix3<f64>) -> Vector3<f64> {
    Rotation3::from_matrix(rotation).scaled_axis()
}

/// Geodesic angle between two rotations, in radians.
pub fn angle_between(a: &Matrix3<f64>, b: &Matrix3<f64>) -> f64 {
    let cos = ((a.transpose() * b).trace() - 1.0) * 0.5;
    cos.clamp(-1.0, 1.0).acos()
}
