//! Pinhole camera with Brown-Conrady (radial-tangential) distortion.
//!
//! Distortion coefficients follow the OpenCV ordering `[k1, k2, p1, p2, k3]`.
//! Bundle adjustment can refine the intrinsics; they are packed as
//! `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::geometry::Extrinsics;

/// Number of intrinsics parameters when they are refined.
pub const NUM_INTRINSICS: usize = 9;

/// Points closer than this to the image plane are treated as not projectable.
const MIN_DEPTH: f64 = 1e-6;

const UNDISTORT_ITERATIONS: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// `[k1, k2, p1, p2, k3]`.
    #[serde(default)]
    pub distortion: [f64; 5],
    pub width: u32,
    pub height: u32,
}

impl CameraModel {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            distortion: [0.0; 5],
            width,
            height,
        }
    }

    pub fn with_distortion(mut self, distortion: [f64; 5]) -> Self {
        self.distortion = distortion;
        self
    }

    /// Applies the distortion model to normalized image coordinates.
    pub fn distort(&self, n: &Vector2<f64>) -> Vector2<f64> {
        let [k1, k2, p1, p2, k3] = self.distortion;
        let (x, y) = (n.x, n.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));
        let x_tan = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let y_tan = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
        Vector2::new(x * radial + x_tan, y * radial + y_tan)
    }

    /// Inverts [`distort`](Self::distort) by fixed-point iteration.
    pub fn undistort_normalized(&self, d: &Vector2<f64>) -> Vector2<f64> {
        let [k1, k2, p1, p2, k3] = self.distortion;
        let mut x = d.x;
        let mut y = d.y;
        for _ in 0..UNDISTORT_ITERATIONS {
            let r2 = x * x + y * y;
            let radial = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));
            if radial.abs() < 1e-12 {
                break;
            }
            let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
            x = (d.x - dx) / radial;
            y = (d.y - dy) / radial;
        }
        Vector2::new(x, y)
    }

    /// Pixel → undistorted normalized coordinates.
    pub fn pixel_to_normalized(&self, px: &Vector2<f64>) -> Vector2<f64> {
        let d = Vector2::new((px.x - self.cx) / self.fx, (px.y - self.cy) / self.fy);
        self.undistort_normalized(&d)
    }

    /// Undistorts pixels into normalized camera coordinates (z = 1 plane).
    pub fn undistort_points(&self, pixels: &[Vector2<f64>]) -> Vec<Vector2<f64>> {
        pixels.iter().map(|p| self.pixel_to_normalized(p)).collect()
    }

    /// Projects a camera-frame point without a depth check.
    #[inline]
    pub fn project_unchecked(&self, p_cam: &Vector3<f64>) -> Vector2<f64> {
        let n = Vector2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z);
        let d = self.distort(&n);
        Vector2::new(self.fx * d.x + self.cx, self.fy * d.y + self.cy)
    }

    /// Projects a camera-frame point; `None` behind or on the image plane.
    pub fn project_camera_point(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z <= MIN_DEPTH {
            return None;
        }
        let uv = self.project_unchecked(p_cam);
        (uv.x.is_finite() && uv.y.is_finite()).then_some(uv)
    }

    /// Projects world points through world→camera extrinsics.
    ///
    /// Points behind the camera are still projected (no depth check) so the
    /// output stays aligned with the input.
    pub fn project_points(
        &self,
        points: &[Vector3<f64>],
        extrinsics: &Extrinsics,
    ) -> Vec<Vector2<f64>> {
        let r = extrinsics.rotation_matrix();
        points
            .iter()
            .map(|p| self.project_unchecked(&(r * p + extrinsics.translation)))
            .collect()
    }

    pub fn intrinsics_params(&self) -> [f64; NUM_INTRINSICS] {
        let [k1, k2, p1, p2, k3] = self.distortion;
        [self.fx, self.fy, self.cx, self.cy, k1, k2, p1, p2, k3]
    }

    /// Copy of this camera with intrinsics read from a packed slice.
    pub fn with_intrinsics_params(&self, p: &[f64]) -> Self {
        Self {
            fx: p[0],
            fy: p[1],
            cx: p[2],
            cy: p[3],
            distortion: [p[4], p[5], p[6], p[7], p[8]],
            width: self.width,
            height: self.height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> CameraModel {
        CameraModel::new(800.0, 790.0, 640.0, 360.0, 1280, 720)
            .with_distortion([0.05, -0.01, 0.001, -0.001, 0.002])
    }

    #[test]
    fn test_principal_point_projection() {
        let cam = camera();
        let uv = cam.project_camera_point(&Vector3::new(0.0, 0.0, 3.0)).unwrap();
        assert_relative_eq!(uv, Vector2::new(640.0, 360.0), epsilon = 1e-12);
    }

    #[test]
    fn test_behind_camera_is_rejected() {
        assert!(camera().project_camera_point(&Vector3::new(0.1, 0.1, -1.0)).is_none());
    }

    #[test]
    fn test_undistort_inverts_distort() {
        let cam = camera();
        let n = Vector2::new(0.31, -0.22);
        let back = cam.undistort_normalized(&cam.distort(&n));
        assert_relative_eq!(back, n, epsilon = 1e-9);
    }

    #[test]
    fn test_pixel_to_normalized_roundtrip() {
        let cam = camera();
        let p = Vector3::new(0.4, -0.25, 2.0);
        let uv = cam.project_camera_point(&p).unwrap();
        let n = cam.pixel_to_normalized(&uv);
        assert_relative_eq!(n, Vector2::new(0.2, -0.125), epsilon = 1e-9);
    }

    #[test]
    fn test_intrinsics_params_roundtrip() {
        let cam = camera();
        let restored = cam.with_intrinsics_params(&cam.intrinsics_params());
        assert_eq!(cam, restored);
    }
}
