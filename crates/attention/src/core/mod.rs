//! Core traits and types shared across attention implementations.
//!
//! Per-head tensors use the layout `[batch, n_heads, seq_len, width]`, where
//! `width` is `head_dim` for queries, keys and values and the random feature
//! count for prime features. Outputs mirror the value layout.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::{AttentionConfig, ResolvedConfig};
pub use errors::{AttentionError, AttentionResult};

/// Linear-time aggregation of prime features against values.
///
/// * `q_prime` and `k_prime` share `[batch, n_heads, seq_len, n_features]`
///   and are entrywise positive.
/// * `v` is `[batch, n_heads, seq_len, head_dim]`.
/// * `key_mask`, when present, is a `[batch, 1, seq_len, 1]` multiplier that
///   zeroes prime keys at padded positions.
/// * The returned context is `[batch, n_heads, seq_len, head_dim]`.
///
/// Implementations never materialise a `seq_len x seq_len` matrix.
pub trait LinearAggregation: Send + Sync {
    /// Combine prime features and values into per-head context vectors.
    fn aggregate(
        &self,
        q_prime: &Tensor,
        k_prime: &Tensor,
        v: &Tensor,
        key_mask: Option<&Tensor>,
    ) -> AttentionResult<Tensor>;
}
