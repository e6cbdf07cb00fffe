//! Bidirectional linear attention.

use candle_core::{Tensor, D};

use super::stabilize_normalizer;
use crate::core::{AttentionError, AttentionResult, LinearAggregation, ResolvedConfig};

/// Computes `q' (k'ᵀ v)` and, optionally, divides by `q' Σ_t k'_t`.
///
/// Built from ordinary tensor ops, so gradients come from Candle's autodiff.
#[derive(Debug, Clone, Copy)]
pub struct NonCausalAttention {
    normalize: bool,
    stabilizer: f64,
}

impl NonCausalAttention {
    pub fn new(normalize: bool, stabilizer: f64) -> Self {
        Self {
            normalize,
            stabilizer,
        }
    }

    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self::new(config.normalize_output, config.normalization_stabilizer)
    }
}

impl LinearAggregation for NonCausalAttention {
    fn aggregate(
        &self,
        q_prime: &Tensor,
        k_prime: &Tensor,
        v: &Tensor,
        key_mask: Option<&Tensor>,
    ) -> AttentionResult<Tensor> {
        let (batch, heads, _, features) = q_prime.dims4()?;
        let (kb, kh, k_len, kf) = k_prime.dims4()?;
        let (vb, vh, v_len, _) = v.dims4()?;
        if (kb, kh, kf) != (batch, heads, features) || (vb, vh, v_len) != (batch, heads, k_len) {
            return Err(AttentionError::shape(format!(
                "non-causal attention: q' {:?}, k' {:?}, v {:?} are incompatible",
                q_prime.dims(),
                k_prime.dims(),
                v.dims()
            )));
        }

        let k_prime = match key_mask {
            Some(mask) => k_prime.broadcast_mul(&mask.to_dtype(k_prime.dtype())?)?,
            None => k_prime.clone(),
        };

        // [b, h, M, Dv]; the L x L product is never formed.
        let kv = k_prime.transpose(2, 3)?.contiguous()?.matmul(&v.contiguous()?)?;
        let context = q_prime.contiguous()?.matmul(&kv)?;
        if !self.normalize {
            return Ok(context);
        }

        let key_sum = k_prime.sum_keepdim(2)?.transpose(2, 3)?.contiguous()?;
        let denominator = q_prime.contiguous()?.matmul(&key_sum)?;
        let denominator = stabilize_normalizer(&denominator, self.stabilizer)?;
        debug_assert_eq!(denominator.dim(D::Minus1)?, 1);
        Ok(context.broadcast_div(&denominator)?)
    }
}
