//! Building blocks for attention projections.
//!
//! This crate hosts the dense projections that surround an attention module
//! (query/key/value inputs and the output projection) together with the
//! helpers used to prune whole attention heads out of those projections. All
//! components are assembled from Candle primitives and keep their parameters
//! in [`candle_core::Var`]s so gradients flow through ordinary autodiff.

pub mod checks;
pub mod linear;
pub mod pruning;

pub use linear::{Linear, LinearConfig, LinearInit, LinearLayer, PruneDim};
pub use pruning::{find_pruneable_heads_and_indices, prune_linear_layer};
