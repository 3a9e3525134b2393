//! Rigid poses stored as a Rodrigues rotation plus a translation.
//!
//! The same type is used for two different mappings:
//! - camera extrinsics map world points into the camera frame (world→camera)
//! - marker extrinsics map canonical marker corners into the world frame

use nalgebra::{Isometry3, Matrix3, Matrix4, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use super::so3;

/// Canonical corners of a marker in its own frame: a unit square in z = 0.
pub const MARKER_CORNERS: [[f64; 3]; 4] = [
    [0.0, 0.0, 0.0],
    [1.0, 0.0, 0.0],
    [1.0, 1.0, 0.0],
    [0.0, 1.0, 0.0],
];

/// Returns the canonical marker corners as vectors.
pub fn marker_corners() -> [Vector3<f64>; 4] {
    MARKER_CORNERS.map(|c| Vector3::new(c[0], c[1], c[2]))
}

/// World-frame corners of a marker placed at `marker`.
pub fn marker_points_world(marker: &Extrinsics) -> [Vector3<f64>; 4] {
    marker_corners().map(|c| marker.transform_point(&c))
}

/// 6-DoF pose `[rx, ry, rz, tx, ty, tz]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extrinsics {
    /// Rodrigues vector (axis × angle).
    pub rotation: Vector3<f64>,
    pub translation: Vector3<f64>,
}

impl Default for Extrinsics {
    fn default() -> Self {
        Self::identity()
    }
}

impl Extrinsics {
    pub fn new(rotation: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self::new(Vector3::zeros(), Vector3::zeros())
    }

    pub fn from_array(v: [f64; 6]) -> Self {
        Self::new(
            Vector3::new(v[0], v[1], v[2]),
            Vector3::new(v[3], v[4], v[5]),
        )
    }

    /// Reads six consecutive values starting at `offset`.
    pub fn from_slice(values: &[f64], offset: usize) -> Self {
        let v = &values[offset..offset + 6];
        Self::from_array([v[0], v[1], v[2], v[3], v[4], v[5]])
    }

    pub fn to_array(&self) -> [f64; 6] {
        [
            self.rotation.x,
            self.rotation.y,
            self.rotation.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        ]
    }

    /// Writes the six values into `values[offset..offset + 6]`.
    pub fn write_to(&self, values: &mut [f64], offset: usize) {
        values[offset..offset + 6].copy_from_slice(&self.to_array());
    }

    pub fn from_rotation_translation(rotation: &Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self::new(so3::log(rotation), translation)
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        so3::exp(&self.rotation)
    }

    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::from(self.translation),
            UnitQuaternion::from_scaled_axis(self.rotation),
        )
    }

    /// Homogeneous 4×4 matrix of this transform.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        self.to_isometry().to_homogeneous()
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation_matrix() * p + self.translation
    }

    pub fn inverse(&self) -> Self {
        let r_inv = self.rotation_matrix().transpose();
        Self::from_rotation_translation(&r_inv, -(r_inv * self.translation))
    }

    /// `self ∘ other`: applies `other` first, then `self`.
    pub fn compose(&self, other: &Extrinsics) -> Self {
        let r = self.rotation_matrix();
        Self::from_rotation_translation(
            &(r * other.rotation_matrix()),
            r * other.translation + self.translation,
        )
    }

    /// Camera centre in world coordinates for world→camera extrinsics.
    pub fn camera_center(&self) -> Vector3<f64> {
        -(self.rotation_matrix().transpose() * self.translation)
    }

    /// True when every component is exactly zero.
    pub fn is_exact_identity(&self) -> bool {
        self.to_array().iter().all(|v| *v == 0.0)
    }

    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }

    /// Largest absolute component difference.
    pub fn max_abs_diff(&self, other: &Extrinsics) -> f64 {
        self.to_array()
            .iter()
            .zip(other.to_array().iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }
}

impl From<Isometry3<f64>> for Extrinsics {
    fn from(iso: Isometry3<f64>) -> Self {
        Self::new(iso.rotation.scaled_axis(), iso.translation.vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_array_roundtrip() {
        let arr = [0.1, -0.2, 0.3, 1.0, 2.0, 3.0];
        assert_eq!(Extrinsics::from_array(arr).to_array(), arr);
    }

    #[test]
    fn test_inverse_compose_is_identity() {
        let e = Extrinsics::from_array([0.2, 0.1, -0.4, 0.5, -1.0, 4.0]);
        let id = e.compose(&e.inverse());

        assert_relative_eq!(id.rotation, Vector3::zeros(), epsilon = 1e-10);
        assert_relative_eq!(id.translation, Vector3::zeros(), epsilon = 1e-10);
    }

    #[test]
    fn test_compose_applies_right_first() {
        let a = Extrinsics::from_array([0.0, 0.0, 0.5, 1.0, 0.0, 0.0]);
        let b = Extrinsics::from_array([0.3, 0.0, 0.0, 0.0, 2.0, 0.0]);
        let p = Vector3::new(0.4, -0.3, 1.2);

        let expected = a.transform_point(&b.transform_point(&p));
        assert_relative_eq!(a.compose(&b).transform_point(&p), expected, epsilon = 1e-10);
    }

    #[test]
    fn test_camera_center_maps_to_origin() {
        let e = Extrinsics::from_array([0.1, -0.3, 0.2, 0.3, 0.2, 5.0]);
        let c = e.camera_center();
        assert_relative_eq!(e.transform_point(&c), Vector3::zeros(), epsilon = 1e-10);
    }

    #[test]
    fn test_matrix_matches_transform_point() {
        let e = Extrinsics::from_array([0.3, 0.2, 0.1, -1.0, 0.5, 2.0]);
        let p = Vector3::new(1.0, 2.0, 3.0);
        let h = e.to_matrix() * p.push(1.0);

        assert_relative_eq!(h.xyz(), e.transform_point(&p), epsilon = 1e-10);
    }

    #[test]
    fn test_marker_points_identity() {
        let pts = marker_points_world(&Extrinsics::identity());
        assert_eq!(pts[2], Vector3::new(1.0, 1.0, 0.0));
    }
}
