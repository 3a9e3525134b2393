//! Block-sparse Jacobian structure for marker bundle adjustment.
//!
//! Each observation contributes eight residual rows (four corners, u and v)
//! which depend only on its frame's six columns, its marker's six columns and,
//! when intrinsics are refined, the shared intrinsics columns. The pattern is
//! stored in CSR form and built once per solve; values are filled in place.

use nalgebra::{DMatrix, DVector};

/// Residual rows per observation.
pub const ROWS_PER_OBSERVATION: usize = 8;

/// Parameters per pose block.
pub const POSE_DIM: usize = 6;

/// Column layout: frames, then markers, then intrinsics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterLayout {
    pub num_frames: usize,
    pub num_markers: usize,
    pub num_intrinsics: usize,
}

impl ParameterLayout {
    pub fn frame_col(&self, frame: usize) -> usize {
        frame * POSE_DIM
    }

    pub fn marker_col(&self, marker: usize) -> usize {
        (self.num_frames + marker) * POSE_DIM
    }

    pub fn intrinsics_col(&self) -> usize {
        (self.num_frames + self.num_markers) * POSE_DIM
    }

    /// Total parameter count.
    pub fn len(&self) -> usize {
        self.intrinsics_col() + self.num_intrinsics
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Columns left after eliminating the frame blocks.
    pub fn reduced_len(&self) -> usize {
        self.len() - self.num_frames * POSE_DIM
    }
}

/// CSR sparsity pattern of the bundle-adjustment Jacobian.
#[derive(Debug, Clone)]
pub struct JacobianSparsity {
    layout: ParameterLayout,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
}

impl JacobianSparsity {
    /// Builds the pattern from the `(frame index, marker index)` of every observation.
    pub fn new(layout: ParameterLayout, blocks: Vec<(usize, usize)>) -> Self {
        let width = 2 * POSE_DIM + layout.num_intrinsics;
        let rows = blocks.len() * ROWS_PER_OBSERVATION;
        let mut row_ptr = Vec::with_capacity(rows + 1);
        let mut col_idx = Vec::with_capacity(rows * width);
        row_ptr.push(0);

        for &(f, m) in &blocks {
            let mut cols = Vec::with_capacity(width);
            cols.extend(layout.frame_col(f)..layout.frame_col(f) + POSE_DIM);
            cols.extend(layout.marker_col(m)..layout.marker_col(m) + POSE_DIM);
            cols.extend(layout.intrinsics_col()..layout.len());
            for _ in 0..ROWS_PER_OBSERVATION {
                col_idx.extend_from_slice(&cols);
                row_ptr.push(col_idx.len());
            }
        }

        Self {
            layout,
            row_ptr,
            col_idx,
        }
    }

    pub fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    pub fn rows(&self) -> usize {
        self.row_ptr.len() - 1
    }

    pub fn cols(&self) -> usize {
        self.layout.len()
    }

    pub fn nnz(&self) -> usize {
        self.col_idx.len()
    }

    /// Non-zeros per row; identical for every row.
    pub fn block_width(&self) -> usize {
        2 * POSE_DIM + self.layout.num_intrinsics
    }

    pub fn row_cols(&self, row: usize) -> &[usize] {
        &self.col_idx[self.row_ptr[row]..self.row_ptr[row + 1]]
    }
}

/// Jacobian values laid out on a [`JacobianSparsity`] pattern.
#[derive(Debug, Clone)]
pub struct SparseJacobian<'a> {
    pattern: &'a JacobianSparsity,
    values: Vec<f64>,
}

impl<'a> SparseJacobian<'a> {
    pub fn zeros(pattern: &'a JacobianSparsity) -> Self {
        Self {
            pattern,
            values: vec![0.0; pattern.nnz()],
        }
    }

    /// Row-major `8 × block_width` values of one observation.
    pub fn observation_block(&self, obs: usize) -> &[f64] {
        let w = self.pattern.block_width() * ROWS_PER_OBSERVATION;
        &self.values[obs * w..(obs + 1) * w]
    }

    pub fn observation_block_mut(&mut self, obs: usize) -> &mut [f64] {
        let w = self.pattern.block_width() * ROWS_PER_OBSERVATION;
        &mut self.values[obs * w..(obs + 1) * w]
    }

    /// Multiplies every row by `scale[row]`.
    pub fn scale_rows(&mut self, scale: &[f64]) {
        for (row, s) in scale.iter().enumerate() {
            let (start, end) = (self.pattern.row_ptr[row], self.pattern.row_ptr[row + 1]);
            for v in &mut self.values[start..end] {
                *v *= s;
            }
        }
    }

    /// `Jᵀ v`.
    pub fn transpose_mul(&self, v: &DVector<f64>) -> DVector<f64> {
        let mut out = DVector::zeros(self.pattern.cols());
        for row in 0..self.pattern.rows() {
            let (start, end) = (self.pattern.row_ptr[row], self.pattern.row_ptr[row + 1]);
            let vr = v[row];
            for k in start..end {
                out[self.pattern.col_idx[k]] += self.values[k] * vr;
            }
        }
        out
    }

    /// `J x`.
    pub fn mul(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut out = DVector::zeros(self.pattern.rows());
        for row in 0..self.pattern.rows() {
            let (start, end) = (self.pattern.row_ptr[row], self.pattern.row_ptr[row + 1]);
            out[row] = (start..end)
                .map(|k| self.values[k] * x[self.pattern.col_idx[k]])
                .sum();
        }
        out
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.pattern.rows(), self.pattern.cols());
        for row in 0..self.pattern.rows() {
            let (start, end) = (self.pattern.row_ptr[row], self.pattern.row_ptr[row + 1]);
            for k in start..end {
                dense[(row, self.pattern.col_idx[k])] = self.values[k];
            }
        }
        dense
    }
}
