//! Robust loss kernels for iteratively re-weighted least squares (IRLS).
//!
//! A kernel maps a squared residual `r²` to a loss `s²·ρ(r²/s²)` where `s` is
//! the scale at which the loss stops being quadratic. The IRLS weight is
//! `ρ'(r²/s²)`; scaling residuals and Jacobian rows by its square root turns
//! one Gauss-Newton step into a step on the robust objective.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// Plain least squares.
    Linear,
    Huber,
    /// `ρ(z) = 2(√(1 + z) − 1)`, a smooth approximation of L1.
    #[default]
    SoftL1,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RobustLoss {
    pub kind: LossKind,
    pub scale: f64,
}

impl RobustLoss {
    pub fn new(kind: LossKind, scale: f64) -> Self {
        Self {
            kind,
            scale: scale.max(f64::EPSILON),
        }
    }

    /// Loss and IRLS weight for a squared residual.
    pub fn rho_and_weight(&self, r2: f64) -> (f64, f64) {
        let s2 = self.scale * self.scale;
        let z = r2 / s2;
        let (rho, weight) = match self.kind {
            LossKind::Linear => (z, 1.0),
            LossKind::Huber => {
                if z <= 1.0 {
                    (z, 1.0)
                } else {
                    let r = z.sqrt();
                    (2.0 * r - 1.0, 1.0 / r)
                }
            }
            LossKind::SoftL1 => {
                let t = (1.0 + z).sqrt();
                (2.0 * (t - 1.0), 1.0 / t)
            }
        };
        (s2 * rho, weight)
    }

    /// Robust cost `½ Σ loss(rᵢ²)` of a residual vector.
    pub fn cost(&self, residuals: &[f64]) -> f64 {
        0.5 * residuals
            .iter()
            .map(|r| self.rho_and_weight(r * r).0)
            .sum::<f64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_kernels_quadratic_near_zero() {
        for kind in [LossKind::Linear, LossKind::Huber, LossKind::SoftL1] {
            let loss = RobustLoss::new(kind, 1.0);
            let (rho, w) = loss.rho_and_weight(1e-6);
            assert_relative_eq!(rho, 1e-6, epsilon = 1e-9);
            assert_relative_eq!(w, 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_huber_linear_for_large_residuals() {
        let loss = RobustLoss::new(LossKind::Huber, 2.0);
        let (rho, w) = loss.rho_and_weight(100.0);
        // r = 10, s = 2: s² (2 r/s − 1) = 4 · 9
        assert_relative_eq!(rho, 36.0, epsilon = 1e-12);
        assert_relative_eq!(w, 0.2, epsilon = 1e-12);
    }

    #[test]
    fn test_soft_l1_downweights_outliers() {
        let loss = RobustLoss::new(LossKind::SoftL1, 1.0);
        let (_, w_small) = loss.rho_and_weight(0.01);
        let (rho_large, w_large) = loss.rho_and_weight(40_000.0);
        assert!(w_small > 0.99);
        assert!(w_large < 0.01);
        // Grows linearly, far below the quadratic cost.
        assert!(rho_large < 401.0);
    }
}
