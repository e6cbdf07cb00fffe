//! Mask utilities shared by the exact and FAVOR+ paths.
//!
//! Callers describe padding with a `[batch, seq_len]` tensor where nonzero
//! entries mark keys that may be attended to. The exact path consumes
//! additive masks with dtype [`MASK_DTYPE`]: `0.0` keeps a score and
//! `f32::NEG_INFINITY` discards it. The FAVOR+ path never forms scores, so it
//! consumes the same information as a `{0, 1}` multiplier on prime keys.

pub mod causal;
pub mod padding;

use candle_core::DType;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use causal::build_causal_mask;
pub use padding::{additive_key_mask, key_mask_multiplier, validate_key_mask};

#[cfg(test)]
mod tests;
