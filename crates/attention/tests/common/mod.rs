#![allow(dead_code)]

use anyhow::Result;
use candle_core::{Device, Tensor};

/// Deterministic, smoothly varying values in `[-amplitude, amplitude]`.
pub fn wave(dims: &[usize], phase: f64, amplitude: f64, device: &Device) -> Result<Tensor> {
    let len: usize = dims.iter().product();
    let data: Vec<f64> = (0..len)
        .map(|i| amplitude * ((i as f64) * 0.7311 + phase).sin())
        .collect();
    Ok(Tensor::from_vec(data, dims, device)?)
}

/// Strictly positive deterministic values, suitable as prime features.
pub fn positive_wave(dims: &[usize], phase: f64, device: &Device) -> Result<Tensor> {
    Ok(wave(dims, phase, 1.0, device)?.abs()?.affine(1.0, 0.05)?)
}

pub fn host(tensor: &Tensor) -> Result<Vec<f64>> {
    Ok(tensor
        .to_dtype(candle_core::DType::F64)?
        .flatten_all()?
        .to_vec1::<f64>()?)
}

pub fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

/// Explicit `L x L` evaluation of linear attention on host vectors.
///
/// `q`/`k` are `[groups, len, m]`, `v` is `[groups, len, dv]`; `attend` is a
/// per-group key mask (`[groups, len]`, nonzero = attend).
#[allow(clippy::too_many_arguments)]
pub fn brute_force(
    q: &[f64],
    k: &[f64],
    v: &[f64],
    attend: Option<&[f64]>,
    groups: usize,
    len: usize,
    m: usize,
    dv: usize,
    causal: bool,
    normalize: bool,
) -> Vec<f64> {
    let mut out = vec![0f64; groups * len * dv];
    for g in 0..groups {
        for i in 0..len {
            let mut weights = vec![0f64; len];
            for (j, w) in weights.iter_mut().enumerate() {
                if causal && j > i {
                    continue;
                }
                if let Some(mask) = attend {
                    if mask[g * len + j] == 0.0 {
                        continue;
                    }
                }
                *w = (0..m)
                    .map(|f| q[(g * len + i) * m + f] * k[(g * len + j) * m + f])
                    .sum();
            }
            let total: f64 = weights.iter().sum();
            let scale = if normalize { 1.0 / total } else { 1.0 };
            for (j, w) in weights.iter().enumerate() {
                for d in 0..dv {
                    out[(g * len + i) * dv + d] += scale * w * v[(g * len + j) * dv + d];
                }
            }
        }
    }
    out
}
