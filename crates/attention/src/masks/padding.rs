//! Key padding masks.
//!
//! The caller-facing form is a `[batch, k_len]` tensor of any numeric dtype
//! with nonzero meaning "attend". It is converted into either an additive
//! `[batch, 1, 1, k_len]` mask for softmax scores or a `[batch, 1, k_len, 1]`
//! multiplier for prime keys.

use candle_core::{DType, Result, Tensor};

use super::MASK_DTYPE;
use crate::core::{AttentionError, AttentionResult};

/// Checks that `mask` is `[batch, k_len]`.
pub fn validate_key_mask(mask: &Tensor, batch: usize, k_len: usize) -> AttentionResult<()> {
    match mask.dims() {
        [b, k] if *b == batch && *k == k_len => Ok(()),
        dims => Err(AttentionError::shape(format!(
            "key padding mask must be [{batch}, {k_len}], got {dims:?}"
        ))),
    }
}

/// Additive `[batch, 1, 1, k_len]` mask: `0.0` for kept keys, `-inf` for padding.
pub fn additive_key_mask(mask: &Tensor) -> Result<Tensor> {
    let (batch, k_len) = mask.dims2()?;
    let keep = mask.ne(0f64)?;
    let zeros = Tensor::zeros((batch, k_len), MASK_DTYPE, mask.device())?;
    let blocked = Tensor::full(f32::NEG_INFINITY, (batch, k_len), mask.device())?;
    keep.where_cond(&zeros, &blocked)?.reshape((batch, 1, 1, k_len))
}

/// `[batch, 1, k_len, 1]` multiplier with `1` for kept keys and `0` for padding.
pub fn key_mask_multiplier(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let (batch, k_len) = mask.dims2()?;
    mask.ne(0f64)?.to_dtype(dtype)?.reshape((batch, 1, k_len, 1))
}
