//! Exact softmax attention.
//!
//! Runs in place of FAVOR+ when the fallback policy decides the random
//! feature path is not worth it, and is the only path that can return the
//! attention weight matrix.

pub mod exact;

pub use exact::ExactAttention;
