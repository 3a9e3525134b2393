//! Sparse robust bundle adjustment over camera and marker poses.
//!
//! Minimizes the reprojection error of every key-marker observation:
//!
//! ```text
//! E = Σ_o Σ_c ρ(||π(K, T_o, M_o · c) − u_oc||²)
//! ```
//!
//! where `T_o` is the observing frame's world→camera pose, `M_o` the marker
//! pose, `c` the four canonical corners and `ρ` a robust kernel applied by
//! IRLS. The solver is a projected Levenberg-Marquardt:
//!
//! ```text
//! (JᵀJ + λ diag(JᵀJ)) δ = −Jᵀr,   x ← clamp(x + δ)
//! ```
//!
//! The normal equations are reduced by eliminating the 6×6 frame blocks
//! (Schur complement), leaving a dense system over markers and intrinsics.
//! The origin marker keeps its parameter slot but is boxed to a tiny interval
//! around zero, which fixes the gauge.
//!
//! Like the rest of the optimizer, the work is split in three phases so the
//! solve can run without touching shared state: the caller collects a
//! [`BundleProblem`], [`solve_bundle`] produces a [`BundleResult`], and the
//! caller applies it.

use std::collections::{BTreeMap, BTreeSet};
use std::f64::consts::PI;

use nalgebra::{DMatrix, DVector, Matrix6, Vector2, Vector6};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::robust::{LossKind, RobustLoss};
use super::sparsity::{
    JacobianSparsity, ParameterLayout, SparseJacobian, POSE_DIM, ROWS_PER_OBSERVATION,
};
use crate::camera::{CameraModel, NUM_INTRINSICS};
use crate::geometry::{marker_corners, Extrinsics};
use crate::markers::{FrameId, KeyMarker, MarkerId};

/// Residual assigned to a corner that lands behind the camera.
const BEHIND_CAMERA_PENALTY: f64 = 100.0;

const MIN_DEPTH: f64 = 1e-6;

/// Configuration for marker bundle adjustment.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BundleAdjustmentConfig {
    /// Maximum number of LM iterations.
    pub max_iterations: usize,
    /// Relative cost decrease below which the solve stops.
    pub ftol: f64,
    /// Relative step size below which the solve stops.
    pub xtol: f64,
    /// Gradient max-norm below which the solve stops.
    pub gtol: f64,
    pub loss: LossKind,
    /// Residual (pixels) where the robust loss leaves its quadratic zone.
    pub loss_scale: f64,
    /// An observation fails when the sum of its four corner errors exceeds this (pixels).
    pub failure_threshold: f64,
    /// Half-width of the box keeping the origin marker at identity.
    pub origin_epsilon: f64,
    /// Bound on every translation component.
    pub max_translation: f64,
    /// Focal lengths may move by this fraction of their initial value.
    pub focal_bound_ratio: f64,
    /// Bound on the magnitude of each distortion coefficient.
    pub distortion_bound: f64,
    /// Relative step for the finite-difference Jacobian.
    pub jacobian_step: f64,
    /// Initial LM damping.
    pub initial_lambda: f64,
}

impl Default for BundleAdjustmentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            ftol: 1e-8,
            xtol: 1e-8,
            gtol: 1e-8,
            loss: LossKind::SoftL1,
            loss_scale: 1.0,
            failure_threshold: 6.0,
            origin_epsilon: 1e-6,
            max_translation: 1e4,
            focal_bound_ratio: 0.5,
            distortion_bound: 2.0,
            jacobian_step: 1e-6,
            initial_lambda: 1e-3,
        }
    }
}

/// Snapshot of everything a bundle adjustment needs.
#[derive(Debug, Clone)]
pub struct BundleProblem {
    /// Initial world→camera poses.
    pub frames: BTreeMap<FrameId, Extrinsics>,
    /// Initial marker→world poses, including the origin.
    pub markers: BTreeMap<MarkerId, Extrinsics>,
    pub origin: MarkerId,
    pub observations: Vec<KeyMarker>,
    pub camera: CameraModel,
    pub refine_intrinsics: bool,
}

/// Optimized poses plus the entities that still do not fit.
#[derive(Debug, Clone)]
pub struct BundleResult {
    /// Optimized frame poses, failed frames excluded.
    pub frames: BTreeMap<FrameId, Extrinsics>,
    /// Optimized marker poses, failed markers excluded.
    pub markers: BTreeMap<MarkerId, Extrinsics>,
    pub failed_frames: BTreeSet<FrameId>,
    pub failed_markers: BTreeSet<MarkerId>,
    /// Every observation of a failed frame or marker.
    pub failed_pairs: Vec<(FrameId, MarkerId)>,
    /// Refined camera when intrinsics were optimized.
    pub intrinsics: Option<CameraModel>,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    pub termination: String,
}

/// An observation with its parameter block indices.
struct Observation {
    frame: usize,
    marker: usize,
    verts: [Vector2<f64>; 4],
}

/// Normal-equation pieces of one frame block.
struct FrameSystem {
    hff: Matrix6<f64>,
    gf: Vector6<f64>,
    /// `J_fᵀ J_m` per marker index.
    coupling: BTreeMap<usize, Matrix6<f64>>,
    /// `J_fᵀ J_k`, 6 × num_intrinsics.
    intrinsics: DMatrix<f64>,
}

struct BundleSolver<'a> {
    camera: &'a CameraModel,
    observations: Vec<Observation>,
    pattern: JacobianSparsity,
    loss: RobustLoss,
    config: &'a BundleAdjustmentConfig,
    lower: DVector<f64>,
    upper: DVector<f64>,
}

/// Runs bundle adjustment on `problem`.
///
/// When observations are flagged as failed, the solve is repeated from the
/// optimized poses without them, so the returned poses carry no trace of the
/// outliers.
///
/// Returns `None` when the problem is empty or `should_stop` aborts the solve.
pub fn solve_bundle(
    problem: &BundleProblem,
    config: &BundleAdjustmentConfig,
    should_stop: &dyn Fn() -> bool,
) -> Option<BundleResult> {
    let first = solve_pass(problem, config, should_stop)?;
    if first.failed_pairs.is_empty() {
        return Some(first);
    }

    let failed: BTreeSet<(FrameId, MarkerId)> = first.failed_pairs.iter().copied().collect();
    let mut retry = problem.clone();
    retry
        .observations
        .retain(|km| !failed.contains(&(km.frame_id, km.marker_id)));
    retry.frames = first.frames.clone();
    retry.markers = first.markers.clone();
    if let Some(camera) = &first.intrinsics {
        retry.camera = camera.clone();
    }

    debug!(
        "re-solving without {} failed observations",
        first.failed_pairs.len()
    );
    match solve_pass(&retry, config, should_stop) {
        Some(second) => Some(merge_passes(first, second)),
        None if should_stop() => None,
        // Every observation failed; nothing left to refine.
        None => Some(first),
    }
}

/// Combines the flagging pass with the re-solve over the remaining observations.
fn merge_passes(first: BundleResult, second: BundleResult) -> BundleResult {
    let mut failed_frames = first.failed_frames;
    failed_frames.extend(second.failed_frames);
    let mut failed_markers = first.failed_markers;
    failed_markers.extend(second.failed_markers);
    let failed_pairs: BTreeSet<(FrameId, MarkerId)> = first
        .failed_pairs
        .into_iter()
        .chain(second.failed_pairs)
        .collect();

    BundleResult {
        frames: second.frames,
        markers: second.markers,
        failed_frames,
        failed_markers,
        failed_pairs: failed_pairs.into_iter().collect(),
        intrinsics: second.intrinsics,
        initial_cost: first.initial_cost,
        final_cost: second.final_cost,
        iterations: first.iterations + second.iterations,
        termination: second.termination,
    }
}

/// One solve followed by failure flagging.
fn solve_pass(
    problem: &BundleProblem,
    config: &BundleAdjustmentConfig,
    should_stop: &dyn Fn() -> bool,
) -> Option<BundleResult> {
    // Only entities with an initial value and at least one observation take part.
    let usable: Vec<&KeyMarker> = problem
        .observations
        .iter()
        .filter(|km| {
            problem.frames.contains_key(&km.frame_id)
                && problem.markers.contains_key(&km.marker_id)
        })
        .collect();
    if usable.is_empty() {
        return None;
    }

    let frame_ids: Vec<FrameId> = usable
        .iter()
        .map(|km| km.frame_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let mut marker_set: BTreeSet<MarkerId> = usable.iter().map(|km| km.marker_id).collect();
    if problem.markers.contains_key(&problem.origin) {
        marker_set.insert(problem.origin);
    }
    let marker_ids: Vec<MarkerId> = marker_set.into_iter().collect();

    let frame_index: BTreeMap<FrameId, usize> =
        frame_ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    let marker_index: BTreeMap<MarkerId, usize> =
        marker_ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();

    let layout = ParameterLayout {
        num_frames: frame_ids.len(),
        num_markers: marker_ids.len(),
        num_intrinsics: if problem.refine_intrinsics { NUM_INTRINSICS } else { 0 },
    };

    let observations: Vec<Observation> = usable
        .iter()
        .map(|km| Observation {
            frame: frame_index[&km.frame_id],
            marker: marker_index[&km.marker_id],
            verts: km.verts,
        })
        .collect();
    let pairs = observations.iter().map(|o| (o.frame, o.marker)).collect();
    let pattern = JacobianSparsity::new(layout, pairs);

    // Initial parameters.
    let mut x0 = DVector::zeros(layout.len());
    for (i, id) in frame_ids.iter().enumerate() {
        problem.frames[id].write_to(x0.as_mut_slice(), layout.frame_col(i));
    }
    for (i, id) in marker_ids.iter().enumerate() {
        problem.markers[id].write_to(x0.as_mut_slice(), layout.marker_col(i));
    }
    if problem.refine_intrinsics {
        let k = problem.camera.intrinsics_params();
        x0.as_mut_slice()[layout.intrinsics_col()..].copy_from_slice(&k);
    }

    let origin_index = marker_index.get(&problem.origin).copied();
    let (lower, upper) = parameter_bounds(&layout, origin_index, &x0, &problem.camera, config);

    let solver = BundleSolver {
        camera: &problem.camera,
        observations,
        pattern,
        loss: RobustLoss::new(config.loss, config.loss_scale),
        config,
        lower,
        upper,
    };

    let x0 = solver.clamp(&x0);
    let outcome = solver.minimize(x0, should_stop)?;

    Some(solver.finish(outcome, &frame_ids, &marker_ids, origin_index, problem))
}

struct Outcome {
    params: DVector<f64>,
    initial_cost: f64,
    final_cost: f64,
    iterations: usize,
    termination: String,
}

/// Box constraints on every parameter.
fn parameter_bounds(
    layout: &ParameterLayout,
    origin_index: Option<usize>,
    x0: &DVector<f64>,
    camera: &CameraModel,
    config: &BundleAdjustmentConfig,
) -> (DVector<f64>, DVector<f64>) {
    let n = layout.len();
    let mut lower = DVector::zeros(n);
    let mut upper = DVector::zeros(n);

    let pose_blocks = layout.num_frames + layout.num_markers;
    for b in 0..pose_blocks {
        let base = b * POSE_DIM;
        for k in 0..3 {
            lower[base + k] = -2.0 * PI;
            upper[base + k] = 2.0 * PI;
            lower[base + 3 + k] = -config.max_translation;
            upper[base + 3 + k] = config.max_translation;
        }
    }

    if let Some(origin) = origin_index {
        let base = layout.marker_col(origin);
        for k in 0..POSE_DIM {
            lower[base + k] = -config.origin_epsilon;
            upper[base + k] = config.origin_epsilon;
        }
    }

    if layout.num_intrinsics > 0 {
        let base = layout.intrinsics_col();
        for k in 0..2 {
            let f = x0[base + k].abs();
            lower[base + k] = f * (1.0 - config.focal_bound_ratio);
            upper[base + k] = f * (1.0 + config.focal_bound_ratio);
        }
        lower[base + 2] = 0.0;
        upper[base + 2] = camera.width as f64;
        lower[base + 3] = 0.0;
        upper[base + 3] = camera.height as f64;
        for k in 4..NUM_INTRINSICS {
            lower[base + k] = (-config.distortion_bound).min(x0[base + k]);
            upper[base + k] = config.distortion_bound.max(x0[base + k]);
        }
    }

    (lower, upper)
}

/// Reprojection residual `projected − observed` of one observation.
fn observation_residual(
    frame: &Extrinsics,
    marker: &Extrinsics,
    camera: &CameraModel,
    verts: &[Vector2<f64>; 4],
) -> [f64; ROWS_PER_OBSERVATION] {
    let rf = frame.rotation_matrix();
    let rm = marker.rotation_matrix();
    let mut out = [0.0; ROWS_PER_OBSERVATION];
    for (c, (corner, observed)) in marker_corners().iter().zip(verts).enumerate() {
        let p_cam = rf * (rm * corner + marker.translation) + frame.translation;
        let (du, dv) = if p_cam.z > MIN_DEPTH {
            let uv = camera.project_unchecked(&p_cam);
            (uv.x - observed.x, uv.y - observed.y)
        } else {
            (BEHIND_CAMERA_PENALTY, BEHIND_CAMERA_PENALTY)
        };
        out[2 * c] = if du.is_finite() { du } else { BEHIND_CAMERA_PENALTY };
        out[2 * c + 1] = if dv.is_finite() { dv } else { BEHIND_CAMERA_PENALTY };
    }
    out
}

impl BundleSolver<'_> {
    fn layout(&self) -> &ParameterLayout {
        self.pattern.layout()
    }

    fn clamp(&self, x: &DVector<f64>) -> DVector<f64> {
        DVector::from_fn(x.len(), |i, _| x[i].clamp(self.lower[i], self.upper[i]))
    }

    fn camera_at(&self, x: &DVector<f64>) -> CameraModel {
        let layout = self.layout();
        if layout.num_intrinsics == 0 {
            self.camera.clone()
        } else {
            self.camera.with_intrinsics_params(&x.as_slice()[layout.intrinsics_col()..])
        }
    }

    fn poses(&self, x: &DVector<f64>, obs: &Observation) -> (Extrinsics, Extrinsics) {
        let layout = self.layout();
        (
            Extrinsics::from_slice(x.as_slice(), layout.frame_col(obs.frame)),
            Extrinsics::from_slice(x.as_slice(), layout.marker_col(obs.marker)),
        )
    }

    fn residuals(&self, x: &DVector<f64>) -> DVector<f64> {
        let camera = self.camera_at(x);
        let mut r = DVector::zeros(self.observations.len() * ROWS_PER_OBSERVATION);
        for (o, obs) in self.observations.iter().enumerate() {
            let (frame, marker) = self.poses(x, obs);
            let block = observation_residual(&frame, &marker, &camera, &obs.verts);
            let rows = o * ROWS_PER_OBSERVATION..(o + 1) * ROWS_PER_OBSERVATION;
            r.as_mut_slice()[rows].copy_from_slice(&block);
        }
        r
    }

    fn step(&self, value: f64) -> f64 {
        self.config.jacobian_step * value.abs().max(1.0)
    }

    /// Central finite differences restricted to the sparsity pattern.
    fn jacobian(&self, x: &DVector<f64>) -> SparseJacobian<'_> {
        let mut jac = SparseJacobian::zeros(&self.pattern);
        let width = self.pattern.block_width();
        let camera = self.camera_at(x);
        let intrinsics = camera.intrinsics_params();
        let num_intrinsics = self.layout().num_intrinsics;

        for (o, obs) in self.observations.iter().enumerate() {
            let (frame, marker) = self.poses(x, obs);
            let frame_arr = frame.to_array();
            let marker_arr = marker.to_array();
            let eval = |f: &Extrinsics, m: &Extrinsics, cam: &CameraModel| {
                observation_residual(f, m, cam, &obs.verts)
            };
            let block = jac.observation_block_mut(o);

            let mut write_column = |col: usize, plus: [f64; 8], minus: [f64; 8], h: f64| {
                for row in 0..ROWS_PER_OBSERVATION {
                    block[row * width + col] = (plus[row] - minus[row]) / (2.0 * h);
                }
            };

            for k in 0..POSE_DIM {
                let h = self.step(frame_arr[k]);
                let mut p = frame_arr;
                p[k] += h;
                let plus = eval(&Extrinsics::from_array(p), &marker, &camera);
                p[k] = frame_arr[k] - h;
                let minus = eval(&Extrinsics::from_array(p), &marker, &camera);
                write_column(k, plus, minus, h);
            }

            for k in 0..POSE_DIM {
                let h = self.step(marker_arr[k]);
                let mut p = marker_arr;
                p[k] += h;
                let plus = eval(&frame, &Extrinsics::from_array(p), &camera);
                p[k] = marker_arr[k] - h;
                let minus = eval(&frame, &Extrinsics::from_array(p), &camera);
                write_column(POSE_DIM + k, plus, minus, h);
            }

            for k in 0..num_intrinsics {
                let h = self.step(intrinsics[k]);
                let mut p = intrinsics;
                p[k] += h;
                let plus = eval(&frame, &marker, &camera.with_intrinsics_params(&p));
                p[k] = intrinsics[k] - h;
                let minus = eval(&frame, &marker, &camera.with_intrinsics_params(&p));
                write_column(2 * POSE_DIM + k, plus, minus, h);
            }
        }
        jac
    }

    /// Accumulates the normal equations, split into frame blocks and the
    /// reduced (markers + intrinsics) system.
    fn normal_equations(
        &self,
        jac: &SparseJacobian<'_>,
        r: &DVector<f64>,
    ) -> (Vec<FrameSystem>, DMatrix<f64>, DVector<f64>) {
        let layout = self.layout();
        let nk = layout.num_intrinsics;
        let width = self.pattern.block_width();
        let reduced = layout.reduced_len();
        let rk = layout.num_markers * POSE_DIM;

        let mut frames: Vec<FrameSystem> = (0..layout.num_frames)
            .map(|_| FrameSystem {
                hff: Matrix6::zeros(),
                gf: Vector6::zeros(),
                coupling: BTreeMap::new(),
                intrinsics: DMatrix::zeros(POSE_DIM, nk),
            })
            .collect();
        let mut hrr = DMatrix::zeros(reduced, reduced);
        let mut gr = DVector::zeros(reduced);

        for (o, obs) in self.observations.iter().enumerate() {
            let b = DMatrix::from_row_slice(ROWS_PER_OBSERVATION, width, jac.observation_block(o));
            let ro = r.rows(o * ROWS_PER_OBSERVATION, ROWS_PER_OBSERVATION);
            let h = b.transpose() * &b;
            let g = b.transpose() * ro;
            let rm = obs.marker * POSE_DIM;

            let fs = &mut frames[obs.frame];
            let coupling = fs.coupling.entry(obs.marker).or_insert_with(Matrix6::zeros);
            for i in 0..POSE_DIM {
                fs.gf[i] += g[i];
                gr[rm + i] += g[POSE_DIM + i];
                for j in 0..POSE_DIM {
                    fs.hff[(i, j)] += h[(i, j)];
                    coupling[(i, j)] += h[(i, POSE_DIM + j)];
                    hrr[(rm + i, rm + j)] += h[(POSE_DIM + i, POSE_DIM + j)];
                }
                for j in 0..nk {
                    let cj = 2 * POSE_DIM + j;
                    fs.intrinsics[(i, j)] += h[(i, cj)];
                    hrr[(rm + i, rk + j)] += h[(POSE_DIM + i, cj)];
                    hrr[(rk + j, rm + i)] += h[(cj, POSE_DIM + i)];
                }
            }
            for i in 0..nk {
                gr[rk + i] += g[2 * POSE_DIM + i];
                for j in 0..nk {
                    hrr[(rk + i, rk + j)] += h[(2 * POSE_DIM + i, 2 * POSE_DIM + j)];
                }
            }
        }
        (frames, hrr, gr)
    }

    /// Solves the damped system by eliminating the frame blocks.
    fn damped_step(
        &self,
        frames: &[FrameSystem],
        hrr: &DMatrix<f64>,
        gr: &DVector<f64>,
        lambda: f64,
    ) -> Option<DVector<f64>> {
        let layout = self.layout();
        let nk = layout.num_intrinsics;
        let rk = layout.num_markers * POSE_DIM;

        let mut s = hrr.clone();
        for i in 0..s.nrows() {
            s[(i, i)] += lambda * s[(i, i)].max(1e-6);
        }
        let mut rhs = -gr;

        // Per frame: damped block inverse and the local coupling matrix.
        let mut eliminated = Vec::with_capacity(frames.len());
        for fs in frames {
            let mut a = fs.hff;
            for i in 0..POSE_DIM {
                a[(i, i)] += lambda * a[(i, i)].max(1e-6);
            }
            let a_inv = match a.cholesky() {
                Some(c) => c.inverse(),
                None => a.try_inverse()?,
            };

            let mut cols = Vec::with_capacity(fs.coupling.len() * POSE_DIM + nk);
            for &m in fs.coupling.keys() {
                cols.extend(m * POSE_DIM..(m + 1) * POSE_DIM);
            }
            cols.extend(rk..rk + nk);

            let mut w = DMatrix::zeros(POSE_DIM, cols.len());
            for (k, block) in fs.coupling.values().enumerate() {
                for i in 0..POSE_DIM {
                    for j in 0..POSE_DIM {
                        w[(i, k * POSE_DIM + j)] = block[(i, j)];
                    }
                }
            }
            let off = fs.coupling.len() * POSE_DIM;
            for i in 0..POSE_DIM {
                for j in 0..nk {
                    w[(i, off + j)] = fs.intrinsics[(i, j)];
                }
            }

            // T = A⁻¹ W; S -= Wᵀ T; rhs += Tᵀ g_f.
            let a_inv_dyn = DMatrix::from_fn(POSE_DIM, POSE_DIM, |i, j| a_inv[(i, j)]);
            let t = &a_inv_dyn * &w;
            let wt_t = w.transpose() * &t;
            let gf = DVector::from_column_slice(fs.gf.as_slice());
            let t_g = t.transpose() * &gf;
            for (li, &gi) in cols.iter().enumerate() {
                rhs[gi] += t_g[li];
                for (lj, &gj) in cols.iter().enumerate() {
                    s[(gi, gj)] -= wt_t[(li, lj)];
                }
            }
            eliminated.push((a_inv, cols, w));
        }

        let delta_r = match s.clone().cholesky() {
            Some(c) => c.solve(&rhs),
            None => s.lu().solve(&rhs)?,
        };

        let mut delta = DVector::zeros(layout.len());
        let frame_cols = layout.num_frames * POSE_DIM;
        delta.rows_mut(frame_cols, delta_r.len()).copy_from(&delta_r);

        for (f, (fs, (a_inv, cols, w))) in frames.iter().zip(&eliminated).enumerate() {
            let local = DVector::from_iterator(cols.len(), cols.iter().map(|&c| delta_r[c]));
            let w_dr = w * local;
            let b = -fs.gf - Vector6::from_column_slice(w_dr.as_slice());
            let df = a_inv * b;
            delta.rows_mut(layout.frame_col(f), POSE_DIM).copy_from(&df);
        }

        delta.iter().all(|v| v.is_finite()).then_some(delta)
    }

    fn irls_weights(&self, r: &DVector<f64>) -> Vec<f64> {
        r.iter().map(|v| self.loss.rho_and_weight(v * v).1.sqrt()).collect()
    }

    fn minimize(&self, x0: DVector<f64>, should_stop: &dyn Fn() -> bool) -> Option<Outcome> {
        let mut x = x0;
        let mut r = self.residuals(&x);
        let mut cost = self.loss.cost(r.as_slice());
        let initial_cost = cost;

        let mut lambda = self.config.initial_lambda;
        let lambda_up = 10.0;
        let lambda_down = 0.1;
        let min_lambda = 1e-10;
        let max_lambda = 1e10;

        let mut iterations = 0;
        let mut termination = String::from("maximum iterations reached");

        for iter in 0..self.config.max_iterations {
            if should_stop() {
                debug!("bundle adjustment cancelled after {} iterations", iter);
                return None;
            }
            iterations = iter + 1;

            let weights = self.irls_weights(&r);
            let mut jac = self.jacobian(&x);
            jac.scale_rows(&weights);
            let rw = DVector::from_iterator(r.len(), r.iter().zip(&weights).map(|(v, w)| v * w));

            let (frames, hrr, gr) = self.normal_equations(&jac, &rw);
            let gradient = jac.transpose_mul(&rw);
            if gradient.amax() < self.config.gtol {
                termination = String::from("gradient tolerance reached");
                break;
            }

            let Some(delta) = self.damped_step(&frames, &hrr, &gr, lambda) else {
                lambda = (lambda * lambda_up).min(max_lambda);
                if lambda >= max_lambda {
                    termination = String::from("singular system");
                    break;
                }
                continue;
            };

            if delta.norm() < self.config.xtol * (x.norm() + self.config.xtol) {
                termination = String::from("step tolerance reached");
                break;
            }

            let trial = self.clamp(&(&x + &delta));
            let trial_r = self.residuals(&trial);
            let trial_cost = self.loss.cost(trial_r.as_slice());

            if trial_cost.is_finite() && trial_cost < cost {
                let reduction = (cost - trial_cost) / cost.max(f64::MIN_POSITIVE);
                x = trial;
                r = trial_r;
                cost = trial_cost;
                lambda = (lambda * lambda_down).max(min_lambda);
                if reduction < self.config.ftol {
                    termination = String::from("cost tolerance reached");
                    break;
                }
            } else {
                lambda = (lambda * lambda_up).min(max_lambda);
                if lambda >= max_lambda {
                    termination = String::from("damping limit reached");
                    break;
                }
            }
        }

        Some(Outcome {
            params: x,
            initial_cost,
            final_cost: cost,
            iterations,
            termination,
        })
    }

    /// Flags failed frames and markers and extracts the optimized poses.
    fn finish(
        &self,
        outcome: Outcome,
        frame_ids: &[FrameId],
        marker_ids: &[MarkerId],
        origin_index: Option<usize>,
        problem: &BundleProblem,
    ) -> BundleResult {
        let layout = self.layout();
        let x = &outcome.params;
        let r = self.residuals(x);

        let mut frame_min = vec![f64::INFINITY; layout.num_frames];
        let mut marker_min = vec![f64::INFINITY; layout.num_markers];
        for (o, obs) in self.observations.iter().enumerate() {
            let block = &r.as_slice()[o * ROWS_PER_OBSERVATION..(o + 1) * ROWS_PER_OBSERVATION];
            let error: f64 = block.chunks_exact(2).map(|c| c[0].hypot(c[1])).sum();
            frame_min[obs.frame] = frame_min[obs.frame].min(error);
            marker_min[obs.marker] = marker_min[obs.marker].min(error);
        }

        let threshold = self.config.failure_threshold;
        let failed_frame_idx: BTreeSet<usize> = (0..layout.num_frames)
            .filter(|&f| frame_min[f] > threshold)
            .collect();
        let failed_marker_idx: BTreeSet<usize> = (0..layout.num_markers)
            .filter(|&m| {
                Some(m) != origin_index && marker_min[m].is_finite() && marker_min[m] > threshold
            })
            .collect();

        let failed_pairs: Vec<(FrameId, MarkerId)> = self
            .observations
            .iter()
            .filter(|o| {
                failed_frame_idx.contains(&o.frame) || failed_marker_idx.contains(&o.marker)
            })
            .map(|o| (frame_ids[o.frame], marker_ids[o.marker]))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let frames = frame_ids
            .iter()
            .enumerate()
            .filter(|(i, _)| !failed_frame_idx.contains(i))
            .map(|(i, &id)| (id, Extrinsics::from_slice(x.as_slice(), layout.frame_col(i))))
            .collect();
        let markers = marker_ids
            .iter()
            .enumerate()
            .filter(|(i, _)| !failed_marker_idx.contains(i))
            .map(|(i, &id)| (id, Extrinsics::from_slice(x.as_slice(), layout.marker_col(i))))
            .collect();

        let failed_frames: BTreeSet<FrameId> =
            failed_frame_idx.iter().map(|&i| frame_ids[i]).collect();
        let failed_markers: BTreeSet<MarkerId> =
            failed_marker_idx.iter().map(|&i| marker_ids[i]).collect();
        if !failed_frames.is_empty() || !failed_markers.is_empty() {
            warn!(
                "bundle adjustment flagged {} frames and {} markers ({} observations)",
                failed_frames.len(),
                failed_markers.len(),
                failed_pairs.len()
            );
        }

        info!(
            "bundle adjustment: {} frames, {} markers, {} observations, \
             cost {:.4} -> {:.4} in {} iterations ({})",
            layout.num_frames,
            layout.num_markers,
            self.observations.len(),
            outcome.initial_cost,
            outcome.final_cost,
            outcome.iterations,
            outcome.termination
        );

        BundleResult {
            frames,
            markers,
            failed_frames,
            failed_markers,
            failed_pairs,
            intrinsics: problem.refine_intrinsics.then(|| self.camera_at(x)),
            initial_cost: outcome.initial_cost,
            final_cost: outcome.final_cost,
            iterations: outcome.iterations,
            termination: outcome.termination,
        }
    }
}
