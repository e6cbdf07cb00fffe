//! Causal linear attention with hand-written gradients.
//!
//! The numerator and the normaliser are registered with Candle as custom ops
//! ([`CausalNumerator`], [`CausalDenominator`]). Their forward passes run the
//! prefix-sum recurrences from [`super::recurrence`] and their `bwd` hooks
//! run the matching reverse walks, so autodiff never records an `L`-step
//! loop. Both ops execute on the CPU backend over `f32`/`f64` storage and
//! accumulate in `f64`.

use candle_core::{CpuStorage, CustomOp2, CustomOp3, DType, Layout, Shape, Tensor, D};

use super::recurrence::{self, RecurrenceDims};
use super::stabilize_normalizer;
use crate::core::{AttentionError, AttentionResult, LinearAggregation, ResolvedConfig};

/// Prefix-sum aggregation where position `t` only sees keys `0..=t`.
#[derive(Debug, Clone, Copy)]
pub struct CausalAttention {
    normalize: bool,
    stabilizer: f64,
}

impl CausalAttention {
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

impl LinearAggregation for CausalAttention {
    fn aggregate(
        &self,
        q_prime: &Tensor,
        k_prime: &Tensor,
        v: &Tensor,
        key_mask: Option<&Tensor>,
    ) -> AttentionResult<Tensor> {
        let (batch, heads, q_len, features) = q_prime.dims4()?;
        let k_dims = k_prime.dims4()?;
        let (vb, vh, v_len, _) = v.dims4()?;
        if k_dims != (batch, heads, q_len, features) || (vb, vh, v_len) != (batch, heads, q_len) {
            return Err(AttentionError::shape(format!(
                "causal attention needs matching query/key/value lengths, got q' {:?}, k' {:?}, v {:?}",
                q_prime.dims(),
                k_prime.dims(),
                v.dims()
            )));
        }
        if q_len == 0 {
            return Err(AttentionError::EmptySequence {
                context: "causal linear attention",
            });
        }

        let out_dtype = v.dtype();
        let work = match out_dtype {
            DType::F64 => DType::F64,
            _ => DType::F32,
        };
        let mut k_prime = k_prime.to_dtype(work)?;
        if let Some(mask) = key_mask {
            k_prime = k_prime.broadcast_mul(&mask.to_dtype(work)?)?;
        }
        let q_prime = q_prime.to_dtype(work)?.contiguous()?;
        let k_prime = k_prime.contiguous()?;
        let v = v.to_dtype(work)?.contiguous()?;

        let mut context = q_prime.apply_op3(&k_prime, &v, CausalNumerator)?;
        if self.normalize {
            let denominator = q_prime
                .apply_op2(&k_prime, CausalDenominator)?
                .unsqueeze(D::Minus1)?;
            let denominator = stabilize_normalizer(&denominator, self.stabilizer)?;
            context = context.broadcast_div(&denominator)?;
        }
        Ok(context.to_dtype(out_dtype)?)
    }
}

/// `out_t = q'_tᵀ Σ_{s<=t} k'_s v_sᵀ` over `[batch, heads, seq, ·]` inputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct CausalNumerator;

/// `out_t = q'_t · Σ_{s<=t} k'_s` over `[batch, heads, seq, features]` inputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct CausalDenominator;

impl CustomOp3 for CausalNumerator {
    fn name(&self) -> &'static str {
        "favor-causal-numerator"
    }

    fn cpu_fwd(
        &self,
        q: &CpuStorage,
        q_layout: &Layout,
        k: &CpuStorage,
        k_layout: &Layout,
        v: &CpuStorage,
        v_layout: &Layout,
    ) -> candle_core::Result<(CpuStorage, Shape)> {
        let (batch, heads, seq_len, features) = q_layout.shape().dims4()?;
        let (.., value_dim) = v_layout.shape().dims4()?;
        if k_layout.shape() != q_layout.shape() {
            candle_core::bail!(
                "causal numerator: k' shape {:?} differs from q' shape {:?}",
                k_layout.shape(),
                q_layout.shape()
            );
        }
        if v_layout.shape().dims()[..3] != q_layout.shape().dims()[..3] {
            candle_core::bail!(
                "causal numerator: v shape {:?} does not match q' {:?}",
                v_layout.shape(),
                q_layout.shape()
            );
        }
        if features == 0 || value_dim == 0 {
            candle_core::bail!("causal numerator: feature and value widths must be non-zero");
        }
        let dims = RecurrenceDims {
            groups: batch * heads,
            seq_len,
            features,
            value_dim,
        };

        let q_host = host_values(q, q_layout, "q'")?;
        let k_host = host_values(k, k_layout, "k'")?;
        let v_host = host_values(v, v_layout, "v")?;
        let out = recurrence::numerator_forward(&q_host, &k_host, &v_host, dims);
        Ok((
            storage_like(v, out),
            Shape::from((batch, heads, seq_len, value_dim)),
        ))
    }

    fn bwd(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        _res: &Tensor,
        grad: &Tensor,
    ) -> candle_core::Result<(Option<Tensor>, Option<Tensor>, Option<Tensor>)> {
        let (batch, heads, seq_len, features) = q.dims4()?;
        let value_dim = v.dim(D::Minus1)?;
        let dims = RecurrenceDims {
            groups: batch * heads,
            seq_len,
            features,
            value_dim,
        };

        let q_host = tensor_values(q)?;
        let k_host = tensor_values(k)?;
        let v_host = tensor_values(v)?;
        let grad_host = tensor_values(grad)?;
        let final_state = recurrence::numerator_final_state(&k_host, &v_host, dims);
        let (grad_q, grad_k, grad_v) = recurrence::numerator_backward(
            &q_host,
            &k_host,
            &v_host,
            &final_state,
            &grad_host,
            dims,
        );
        Ok((
            Some(tensor_like(grad_q, q)?),
            Some(tensor_like(grad_k, k)?),
            Some(tensor_like(grad_v, v)?),
        ))
    }
}

impl CustomOp2 for CausalDenominator {
    fn name(&self) -> &'static str {
        "favor-causal-denominator"
    }

    fn cpu_fwd(
        &self,
        q: &CpuStorage,
        q_layout: &Layout,
        k: &CpuStorage,
        k_layout: &Layout,
    ) -> candle_core::Result<(CpuStorage, Shape)> {
        let (batch, heads, seq_len, features) = q_layout.shape().dims4()?;
        if k_layout.shape() != q_layout.shape() {
            candle_core::bail!(
                "causal denominator: k' shape {:?} differs from q' shape {:?}",
                k_layout.shape(),
                q_layout.shape()
            );
        }
        let dims = RecurrenceDims {
            groups: batch * heads,
            seq_len,
            features,
            value_dim: 0,
        };
        let q_host = host_values(q, q_layout, "q'")?;
        let k_host = host_values(k, k_layout, "k'")?;
        let out = recurrence::denominator_forward(&q_host, &k_host, dims);
        Ok((storage_like(q, out), Shape::from((batch, heads, seq_len))))
    }

    fn bwd(
        &self,
        q: &Tensor,
        k: &Tensor,
        _res: &Tensor,
        grad: &Tensor,
    ) -> candle_core::Result<(Option<Tensor>, Option<Tensor>)> {
        let (batch, heads, seq_len, features) = q.dims4()?;
        let dims = RecurrenceDims {
            groups: batch * heads,
            seq_len,
            features,
            value_dim: 0,
        };
        let q_host = tensor_values(q)?;
        let k_host = tensor_values(k)?;
        let grad_host = tensor_values(grad)?;
        let final_state = recurrence::denominator_final_state(&k_host, dims);
        let (grad_q, grad_k) =
            recurrence::denominator_backward(&q_host, &k_host, &final_state, &grad_host, dims);
        Ok((Some(tensor_like(grad_q, q)?), Some(tensor_like(grad_k, k)?)))
    }
}

fn host_values(storage: &CpuStorage, layout: &Layout, name: &str) -> candle_core::Result<Vec<f64>> {
    let Some((start, end)) = layout.contiguous_offsets() else {
        candle_core::bail!("{name} must be contiguous for causal linear attention");
    };
    match storage {
        CpuStorage::F32(data) => Ok(data[start..end].iter().map(|&x| f64::from(x)).collect()),
        CpuStorage::F64(data) => Ok(data[start..end].to_vec()),
        _ => candle_core::bail!("{name}: causal linear attention supports f32 and f64 storage"),
    }
}

fn storage_like(reference: &CpuStorage, values: Vec<f64>) -> CpuStorage {
    match reference {
        CpuStorage::F64(_) => CpuStorage::F64(values),
        _ => CpuStorage::F32(values.into_iter().map(|x| x as f32).collect()),
    }
}

fn tensor_values(tensor: &Tensor) -> candle_core::Result<Vec<f64>> {
    tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()
}

fn tensor_like(values: Vec<f64>, reference: &Tensor) -> candle_core::Result<Tensor> {
    Tensor::from_vec(values, reference.shape(), reference.device())?.to_dtype(reference.dtype())
}
