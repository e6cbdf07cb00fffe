//! Exact softmax attention used as the short-sequence fallback.
//!
//! Scores are `q kᵀ / sqrt(d_model)` where `d_model` is the width of the
//! caller's inputs, so the temperature matches the FAVOR+ path's
//! `d_model^{-1/4}` pre-scaling of each side. Half-precision inputs are
//! promoted to `f32` for the softmax and cast back afterwards.

use std::sync::OnceLock;

use candle_core::{DType, Tensor, D};
use candle_nn::ops::{dropout, softmax};

use crate::core::{AttentionError, AttentionResult, ResolvedConfig};
use crate::masks::{additive_key_mask, build_causal_mask, validate_key_mask};

/// Quadratic attention that materialises the full weight matrix.
#[derive(Debug)]
pub struct ExactAttention {
    scale: f64,
    causal: bool,
    dropout_p: f32,
    first_call: OnceLock<()>,
}

impl ExactAttention {
    /// `input_width` is the model width used for the `1/sqrt(d)` temperature.
    pub fn new(input_width: usize, causal: bool, dropout_p: f32) -> Self {
        Self {
            scale: (input_width as f64).powf(-0.5),
            causal,
            dropout_p,
            first_call: OnceLock::new(),
        }
    }

    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self::new(config.d_model, config.causal, config.attention_dropout)
    }

    /// Returns `(context, weights)`.
    ///
    /// * `q`: `[batch, heads, q_len, head_dim]`, `k`/`v`: `[batch, heads, k_len, head_dim]`.
    /// * `key_mask`: optional `[batch, k_len]`, nonzero entries are attended.
    /// * `weights`: `[batch, heads, q_len, k_len]`, after dropout when training.
    pub fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        key_mask: Option<&Tensor>,
        training: bool,
    ) -> AttentionResult<(Tensor, Tensor)> {
        if self.first_call.set(()).is_ok() {
            log::debug!(
                "attention::reference init scale={:.6} causal={} dropout={}",
                self.scale,
                self.causal,
                self.dropout_p
            );
        }

        let (batch, heads, q_len, head_dim) =
            q.dims4().map_err(|_| AttentionError::InvalidShape {
                context: "q must have shape [batch, heads, seq_len, head_dim]".to_string(),
            })?;
        let (kb, kh, k_len, kd) = k.dims4().map_err(|_| AttentionError::InvalidShape {
            context: "k must have shape [batch, heads, seq_len, head_dim]".to_string(),
        })?;
        let (vb, vh, vk, _) = v.dims4().map_err(|_| AttentionError::InvalidShape {
            context: "v must have shape [batch, heads, seq_len, head_dim]".to_string(),
        })?;
        if kb != batch || kh != heads || kd != head_dim {
            return Err(AttentionError::shape(format!(
                "k shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
            )));
        }
        if vb != batch || vh != heads || vk != k_len {
            return Err(AttentionError::shape(format!(
                "v shape mismatch: expected [{batch}, {heads}, {k_len}, ?] got {:?}",
                v.dims()
            )));
        }
        if q_len == 0 || k_len == 0 {
            return Err(AttentionError::EmptySequence {
                context: "exact attention",
            });
        }

        let dtype = q.dtype();
        let work = match dtype {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        let q = q.to_dtype(work)?;
        let k = k.to_dtype(work)?;
        let v = v.to_dtype(work)?;

        let mut scores = q
            .contiguous()?
            .matmul(&k.transpose(2, 3)?.contiguous()?)?
            .affine(self.scale, 0.0)?;
        if let Some(mask) = key_mask {
            validate_key_mask(mask, batch, k_len)?;
            let additive = additive_key_mask(mask)?.to_dtype(work)?;
            scores = scores.broadcast_add(&additive)?;
        }
        if self.causal {
            let causal = build_causal_mask(q.device(), q_len, k_len)?.to_dtype(work)?;
            scores = scores.broadcast_add(&causal)?;
        }

        let mut weights = softmax(&scores, D::Minus1)?;
        if training && self.dropout_p > 0.0 {
            weights = dropout(&weights, self.dropout_p)?;
        }
        let context = weights.matmul(&v.contiguous()?)?;
        Ok((context.to_dtype(dtype)?, weights.to_dtype(dtype)?))
    }
}
