//! Geometry utilities: extrinsics, SO(3), homographies, PnP and triangulation.

pub mod extrinsics;
pub mod homography;
pub mod pnp;
pub mod so3;
pub mod triangulation;

pub use extrinsics::{marker_corners, marker_points_world, Extrinsics, MARKER_CORNERS};
pub use pnp::{is_plausible_pose, solve_pnp};
pub use triangulation::{rigid_fit, triangulate_point, RigidFit};
