//! Helpers for removing whole attention heads from projection layers.
//!
//! Heads are identified by their index in the *original* head numbering. Once
//! a head has been pruned the remaining heads are renumbered contiguously in
//! the layer weights, so later pruning requests must be translated through the
//! set of heads that are already gone.

use std::collections::BTreeSet;

use candle_core::Result;

use crate::linear::{Linear, PruneDim};

/// Resolves which heads to prune and the feature indices to keep.
///
/// `heads` are original head indices and `num_heads` is the current head
/// count; entries already present in `already_pruned` are ignored. Returns
/// the set of newly pruned heads and the flat `(num_heads * head_size)`
/// indices of the features that survive, in ascending order and expressed in
/// the layer's current numbering.
pub fn find_pruneable_heads_and_indices(
    heads: &[usize],
    num_heads: usize,
    head_size: usize,
    already_pruned: &BTreeSet<usize>,
) -> (BTreeSet<usize>, Vec<u32>) {
    let heads: BTreeSet<usize> = heads
        .iter()
        .copied()
        .filter(|head| !already_pruned.contains(head))
        .collect();

    let mut keep = vec![true; num_heads];
    for &head in &heads {
        let shift = already_pruned.iter().filter(|&&p| p < head).count();
        if let Some(slot) = keep.get_mut(head - shift) {
            *slot = false;
        }
    }

    let index = keep
        .iter()
        .enumerate()
        .filter(|(_, &kept)| kept)
        .flat_map(|(head, _)| (head * head_size..(head + 1) * head_size).map(|i| i as u32))
        .collect();
    (heads, index)
}

/// Returns a copy of `layer` keeping only `index` along `dim`.
pub fn prune_linear_layer(layer: &Linear, index: &[u32], dim: PruneDim) -> Result<Linear> {
    layer.prune(index, dim)
}
