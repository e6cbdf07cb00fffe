//! Linear-time aggregation of prime features against values.
//!
//! [`NonCausalAttention`] associates the product as `q' (k'ᵀ v)`;
//! [`CausalAttention`] runs the prefix-sum recurrence in [`recurrence`]
//! through custom ops with hand-written gradients.

pub mod causal;
pub mod noncausal;
pub mod recurrence;

use candle_core::Tensor;

use crate::core::{AttentionResult, LinearAggregation, ResolvedConfig};

pub use causal::{CausalAttention, CausalDenominator, CausalNumerator};
pub use noncausal::NonCausalAttention;
pub use recurrence::RecurrenceDims;

/// Pushes normaliser entries with `|d| <= stabilizer` away from zero by
/// adding `2 * stabilizer`.
pub(crate) fn stabilize_normalizer(denominator: &Tensor, stabilizer: f64) -> AttentionResult<Tensor> {
    let small = denominator
        .abs()?
        .le(stabilizer)?
        .to_dtype(denominator.dtype())?;
    Ok(denominator.add(&small.affine(2.0 * stabilizer, 0.0)?)?)
}

/// Picks the aggregation matching `config.causal`.
pub fn aggregation_for(config: &ResolvedConfig) -> Box<dyn LinearAggregation> {
    if config.causal {
        Box::new(CausalAttention::from_config(config))
    } else {
        Box::new(NonCausalAttention::from_config(config))
    }
}
