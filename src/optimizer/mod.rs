//! Bundle adjustment over camera and marker poses.
//!
//! - [`robust`] - loss kernels applied by IRLS
//! - [`sparsity`] - block-sparse Jacobian pattern
//! - [`bundle_adjustment`] - bounded sparse Levenberg-Marquardt solver

pub mod bundle_adjustment;
pub mod robust;
pub mod sparsity;

pub use bundle_adjustment::{solve_bundle, BundleAdjustmentConfig, BundleProblem, BundleResult};
pub use robust::{LossKind, RobustLoss};
pub use sparsity::{JacobianSparsity, ParameterLayout};
