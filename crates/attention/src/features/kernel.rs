//! Kernel feature maps producing FAVOR+ prime features.
//!
//! Queries and keys arrive per head as `[batch, heads, seq, head_dim]`. Both
//! are scaled by `d_model^{-1/4}` so that `q'·k'` recovers the usual
//! `1/sqrt(d_model)` softmax temperature, projected onto the random feature
//! rows, and passed through the selected kernel.
//!
//! The softmax kernels (`exp`, `cosh`) fold `h(x) = -|x|^2 / 2` into the
//! exponent after subtracting a stabiliser from it: per row for queries, a
//! single global maximum for keys. The stabiliser multiplies every feature of
//! a row by the same factor (both halves of `cosh` included), so it cancels
//! once outputs are normalised. Their features are scaled by `width^{-1/2}`.
//!
//! The generalized kernels (`elu`, `relu`) apply their nonlinearity to the
//! projection directly and skip the `width^{-1/2}` factor. With
//! `normalize_output = true` the factor cancels anyway; with
//! `normalize_output = false` their outputs are `width` times larger than
//! the scaled form would give.

use std::fmt;
use std::str::FromStr;

use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

use crate::core::{AttentionError, AttentionResult, ResolvedConfig};

/// Kernel applied to randomly projected queries and keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelType {
    /// `exp(h + x)`: positive random features for the softmax kernel.
    Exp,
    /// `[exp(h + x), exp(h - x)]`: hyperbolic-cosine variant, doubles the width.
    Cosh,
    /// `elu(x) + 1`.
    Elu,
    /// `relu(x)`.
    Relu,
}

impl KernelType {
    /// Whether the kernel estimates the softmax kernel (and uses `h(x)`).
    pub fn approximates_softmax(self) -> bool {
        matches!(self, Self::Exp | Self::Cosh)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Exp => "exp",
            Self::Cosh => "cosh",
            Self::Elu => "elu",
            Self::Relu => "relu",
        }
    }
}

impl fmt::Display for KernelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for KernelType {
    type Err = AttentionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exp" => Ok(Self::Exp),
            "cosh" => Ok(Self::Cosh),
            "elu" => Ok(Self::Elu),
            "relu" => Ok(Self::Relu),
            other => Err(AttentionError::InvalidConfig(format!(
                "unknown kernel_type '{other}'"
            ))),
        }
    }
}

/// Turns per-head queries and keys into prime features.
#[derive(Debug, Clone, Copy)]
pub struct KernelFeatureMap {
    kernel: KernelType,
    d_model: usize,
    epsilon: f64,
}

impl KernelFeatureMap {
    pub fn new(kernel: KernelType, d_model: usize, epsilon: f64) -> Self {
        Self {
            kernel,
            d_model,
            epsilon,
        }
    }

    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self::new(config.kernel, config.d_model, config.kernel_epsilon)
    }

    /// Model width used for the `d_model^{-1/4}` pre-scaling.
    pub fn set_d_model(&mut self, d_model: usize) {
        self.d_model = d_model;
    }

    /// Computes `(q', k')` from `[batch, heads, seq, head_dim]` inputs and a
    /// `[num_features, head_dim]` feature matrix.
    ///
    /// Outputs are `[batch, heads, seq, width]` with `width = num_features`,
    /// or `2 * num_features` for [`KernelType::Cosh`], and strictly positive.
    pub fn project(
        &self,
        q: &Tensor,
        k: &Tensor,
        features: &Tensor,
    ) -> AttentionResult<(Tensor, Tensor)> {
        let head_dim = q.dim(D::Minus1)?;
        let (num_features, feature_dim) = features.dims2()?;
        if feature_dim != head_dim || k.dim(D::Minus1)? != head_dim {
            return Err(AttentionError::shape(format!(
                "feature matrix [{num_features}, {feature_dim}] does not match head_dim {head_dim}"
            )));
        }

        let scale = (self.d_model as f64).powf(-0.25);
        let q = q.affine(scale, 0.0)?;
        let k = k.affine(scale, 0.0)?;
        let w_t = features.to_dtype(q.dtype())?.t()?.contiguous()?;
        let projected_q = project_rows(&q, &w_t)?;
        let projected_k = project_rows(&k, &w_t)?;

        if !self.kernel.approximates_softmax() {
            let q_prime = self.generalized(&projected_q)?;
            let k_prime = self.generalized(&projected_k)?;
            return Ok((q_prime, k_prime));
        }

        let h_q = half_neg_sq_norm(&q)?;
        let h_k = half_neg_sq_norm(&k)?;
        // Per-row maximum for queries, one scalar for the whole key tensor.
        let q_stabilizer = h_q.max_keepdim(D::Minus1)?;
        let k_stabilizer = h_k.flatten_all()?.max(0)?;

        // The stabiliser shifts h so that both cosh halves share the same factor.
        let q_kernel = self.softmax_kernel(&projected_q, &h_q.broadcast_sub(&q_stabilizer)?)?;
        let k_kernel = self.softmax_kernel(&projected_k, &h_k.broadcast_sub(&k_stabilizer)?)?;

        let width = q_kernel.dim(D::Minus1)?;
        let normalizer = (width as f64).powf(-0.5);
        let q_prime = q_kernel.affine(normalizer, normalizer * self.epsilon)?;
        let k_prime = k_kernel.affine(normalizer, normalizer * self.epsilon)?;
        Ok((q_prime, k_prime))
    }

    fn softmax_kernel(&self, x: &Tensor, h: &Tensor) -> AttentionResult<Tensor> {
        let positive = x.broadcast_add(h)?.exp()?;
        match self.kernel {
            KernelType::Cosh => {
                let negative = h.broadcast_sub(x)?.exp()?;
                Ok(Tensor::cat(&[&positive, &negative], D::Minus1)?)
            }
            _ => Ok(positive),
        }
    }

    fn generalized(&self, x: &Tensor) -> AttentionResult<Tensor> {
        let out = match self.kernel {
            KernelType::Elu => x.elu(1.0)?.affine(1.0, 1.0 + self.epsilon)?,
            _ => x.relu()?.affine(1.0, self.epsilon)?,
        };
        Ok(out)
    }
}

/// `x @ w_t` over the trailing dimension for rank-4 `x`.
fn project_rows(x: &Tensor, w_t: &Tensor) -> AttentionResult<Tensor> {
    let (batch, heads, seq, head_dim) = x.dims4()?;
    let features = w_t.dim(1)?;
    let flat = x.reshape((batch * heads * seq, head_dim))?;
    Ok(flat.matmul(w_t)?.reshape((batch, heads, seq, features))?)
}

/// `h(x) = -|x|^2 / 2` over the head dimension, kept as a trailing axis of 1.
fn half_neg_sq_norm(x: &Tensor) -> AttentionResult<Tensor> {
    Ok(x.sqr()?.sum_keepdim(D::Minus1)?.affine(-0.5, 0.0)?)
}
