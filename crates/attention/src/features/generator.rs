//! Random projection matrices for the FAVOR+ feature map.
//!
//! Matrices are sampled on the host in `f64` and uploaded once per draw. The
//! orthogonal variant stacks transposed `Q` factors of Gaussian matrices so
//! rows inside each `d_head`-sized block are mutually orthogonal, then fixes up
//! row norms: either a constant `sqrt(d_head)` (SMREG) or the norm of an
//! independent Gaussian vector, which restores the length distribution of
//! unstructured Gaussian rows.

use candle_core::{DType, Device, Tensor};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::core::{AttentionResult, ResolvedConfig};

/// Default feature count `round(d_head * ln(d_head))`.
pub fn num_random_features(head_dim: usize) -> usize {
    let d = head_dim as f64;
    (d * d.ln()).round().max(0.0) as usize
}

/// Draws `num_features x head_dim` projection matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomFeatureGenerator {
    head_dim: usize,
    num_features: usize,
    orthogonal: bool,
    regularize_norms: bool,
}

impl RandomFeatureGenerator {
    pub fn new(head_dim: usize, num_features: usize, orthogonal: bool, regularize_norms: bool) -> Self {
        Self {
            head_dim,
            num_features,
            orthogonal,
            regularize_norms,
        }
    }

    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self::new(
            config.head_dim,
            config.num_features,
            config.use_orthogonal_features,
            config.regularize_feature_norms,
        )
    }

    /// Samples a fresh matrix on the host.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> DMatrix<f64> {
        if !self.orthogonal {
            return gaussian(self.num_features, self.head_dim, rng);
        }

        let blocks = self.orthogonal_rows(rng);
        if self.regularize_norms {
            blocks * (self.head_dim as f64).sqrt()
        } else {
            let reference = gaussian(self.num_features, self.head_dim, rng);
            let norms = DVector::from_iterator(
                self.num_features,
                reference.row_iter().map(|row| row.norm()),
            );
            DMatrix::from_diagonal(&norms) * blocks
        }
    }

    /// Stacked orthonormal blocks before any norm correction.
    ///
    /// Rows `[b * d_head, (b + 1) * d_head)` come from one `Q` factor; the
    /// final block is truncated to reach exactly `num_features` rows.
    pub fn orthogonal_rows<R: Rng + ?Sized>(&self, rng: &mut R) -> DMatrix<f64> {
        let d = self.head_dim;
        let full_blocks = self.num_features / d;
        let remainder = self.num_features % d;

        let mut rows = DMatrix::zeros(self.num_features, d);
        for block in 0..full_blocks {
            let square = orthogonal_block(d, rng);
            rows.rows_mut(block * d, d).copy_from(&square);
        }
        if remainder > 0 {
            let square = orthogonal_block(d, rng);
            rows.rows_mut(full_blocks * d, remainder)
                .copy_from(&square.rows(0, remainder));
        }
        rows
    }

    /// Samples a matrix and uploads it as a `[num_features, head_dim]` tensor.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        device: &Device,
        dtype: DType,
    ) -> AttentionResult<Tensor> {
        let matrix = self.sample(rng);
        // Column-major transpose storage is the row-major layout of `matrix`.
        let data = matrix.transpose().as_slice().to_vec();
        let tensor = Tensor::from_vec(data, (self.num_features, self.head_dim), device)?;
        Ok(tensor.to_dtype(dtype)?)
    }
}

fn gaussian<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> DMatrix<f64> {
    DMatrix::from_fn(rows, cols, |_, _| rng.sample(StandardNormal))
}

fn orthogonal_block<R: Rng + ?Sized>(size: usize, rng: &mut R) -> DMatrix<f64> {
    gaussian(size, size, rng).qr().q().transpose()
}
