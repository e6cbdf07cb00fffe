//! FAVOR+ (Performer) attention for Candle.
//!
//! The crate approximates softmax attention in linear time and memory with
//! positive orthogonal random features. Inputs are `[batch, seq_len,
//! d_model]` tensors; internally every component works on per-head tensors
//! laid out as `[batch, n_heads, seq_len, width]`.
//!
//! * [`features`] draws the random projection, maps queries/keys to
//!   positive prime features, and schedules redraws.
//! * [`linear`] aggregates prime features against values, bidirectionally or
//!   causally. The causal path registers custom ops with hand-written
//!   gradients so memory stays linear in the sequence length.
//! * [`fallback`] decides when exact softmax attention ([`reference`]) is
//!   cheaper than the approximation.
//! * [`PerformerAttention`] ties these together behind a single forward call
//!   and owns the Q/K/V and output projections.
//!
//! Configuration is validated once ([`AttentionConfig::resolve`]) and shared
//! by reference. Logging goes through the `log` facade; the crate installs no
//! logger.

pub mod core;
pub mod fallback;
pub mod features;
pub mod linear;
pub mod masks;
pub mod performer;
pub mod reference;

pub use core::{AttentionConfig, AttentionError, AttentionResult, LinearAggregation, ResolvedConfig};
pub use fallback::{FallbackFn, ShortSequenceBehavior};
pub use features::{num_random_features, KernelFeatureMap, KernelType, RandomFeatureGenerator};
pub use linear::{CausalAttention, NonCausalAttention};
pub use performer::{AttentionOutput, PerformerAttention};
pub use reference::ExactAttention;
