//! Host-side prefix-sum recurrences behind causal linear attention.
//!
//! Every buffer is a flat row-major `f64` slice laid out as
//! `[groups, seq_len, width]`, where a group is one `(batch, head)` pair.
//! Groups are independent; positions inside a group are processed strictly
//! in order because each step reads the accumulator left by the previous one.
//!
//! Numerator, per group:
//!
//! ```text
//! S_0 = 0
//! S_t = S_{t-1} + k'_t v_tᵀ          (M x Dv)
//! out_t = q'_tᵀ S_t                   (Dv)
//! ```
//!
//! Denominator, per group, with an `M`-vector accumulator:
//!
//! ```text
//! s_t = s_{t-1} + k'_t
//! out_t = q'_t · s_t
//! ```
//!
//! The backward passes walk positions from last to first. They start from
//! the final accumulator and subtract each position's contribution on the
//! way down, so memory stays at one accumulator per group instead of one
//! per position.

/// Extents shared by the recurrence buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecurrenceDims {
    /// `batch * heads`.
    pub groups: usize,
    pub seq_len: usize,
    /// Width of `q'` and `k'`.
    pub features: usize,
    /// Width of `v`. Unused by the denominator.
    pub value_dim: usize,
}

impl RecurrenceDims {
    fn feature_len(&self) -> usize {
        self.groups * self.seq_len * self.features
    }

    fn value_len(&self) -> usize {
        self.groups * self.seq_len * self.value_dim
    }
}

/// Causal numerator: `[groups, seq_len, value_dim]`.
pub fn numerator_forward(q: &[f64], k: &[f64], v: &[f64], dims: RecurrenceDims) -> Vec<f64> {
    let RecurrenceDims {
        groups,
        seq_len,
        features: m,
        value_dim: dv,
    } = dims;
    debug_assert_eq!(q.len(), dims.feature_len());
    debug_assert_eq!(k.len(), dims.feature_len());
    debug_assert_eq!(v.len(), dims.value_len());

    let mut out = vec![0f64; dims.value_len()];
    let mut state = vec![0f64; m * dv];
    for g in 0..groups {
        state.fill(0.0);
        for t in 0..seq_len {
            let q_t = &q[(g * seq_len + t) * m..][..m];
            let k_t = &k[(g * seq_len + t) * m..][..m];
            let v_t = &v[(g * seq_len + t) * dv..][..dv];
            add_outer(&mut state, k_t, v_t, 1.0);
            let out_t = &mut out[(g * seq_len + t) * dv..][..dv];
            for (row, &q_val) in state.chunks_exact(dv).zip(q_t) {
                for (o, &s) in out_t.iter_mut().zip(row) {
                    *o += q_val * s;
                }
            }
        }
    }
    out
}

/// Accumulator after the last position, `[groups, features, value_dim]`.
pub fn numerator_final_state(k: &[f64], v: &[f64], dims: RecurrenceDims) -> Vec<f64> {
    let RecurrenceDims {
        groups,
        seq_len,
        features: m,
        value_dim: dv,
    } = dims;
    let mut states = vec![0f64; groups * m * dv];
    for (g, state) in states.chunks_exact_mut(m * dv).enumerate() {
        for t in 0..seq_len {
            let k_t = &k[(g * seq_len + t) * m..][..m];
            let v_t = &v[(g * seq_len + t) * dv..][..dv];
            add_outer(state, k_t, v_t, 1.0);
        }
    }
    states
}

/// Gradients of the numerator with respect to `(q', k', v)`.
///
/// `final_state` comes from [`numerator_final_state`]; `grad` has the shape
/// of the forward output.
pub fn numerator_backward(
    q: &[f64],
    k: &[f64],
    v: &[f64],
    final_state: &[f64],
    grad: &[f64],
    dims: RecurrenceDims,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let RecurrenceDims {
        groups,
        seq_len,
        features: m,
        value_dim: dv,
    } = dims;
    let mut grad_q = vec![0f64; dims.feature_len()];
    let mut grad_k = vec![0f64; dims.feature_len()];
    let mut grad_v = vec![0f64; dims.value_len()];

    let mut running = vec![0f64; m * dv];
    let mut adjoint = vec![0f64; m * dv];
    for g in 0..groups {
        running.copy_from_slice(&final_state[g * m * dv..][..m * dv]);
        adjoint.fill(0.0);
        for t in (0..seq_len).rev() {
            let feature_at = (g * seq_len + t) * m;
            let value_at = (g * seq_len + t) * dv;
            let q_t = &q[feature_at..][..m];
            let k_t = &k[feature_at..][..m];
            let v_t = &v[value_at..][..dv];
            let g_t = &grad[value_at..][..dv];

            // running == S_t here.
            for (gq, row) in grad_q[feature_at..][..m]
                .iter_mut()
                .zip(running.chunks_exact(dv))
            {
                *gq = dot(row, g_t);
            }

            add_outer(&mut adjoint, q_t, g_t, 1.0);

            for (gk, row) in grad_k[feature_at..][..m]
                .iter_mut()
                .zip(adjoint.chunks_exact(dv))
            {
                *gk = dot(row, v_t);
            }
            let gv_t = &mut grad_v[value_at..][..dv];
            for (row, &k_val) in adjoint.chunks_exact(dv).zip(k_t) {
                for (gv, &a) in gv_t.iter_mut().zip(row) {
                    *gv += a * k_val;
                }
            }

            add_outer(&mut running, k_t, v_t, -1.0);
        }
    }
    (grad_q, grad_k, grad_v)
}

/// Causal denominator: `[groups, seq_len]`.
pub fn denominator_forward(q: &[f64], k: &[f64], dims: RecurrenceDims) -> Vec<f64> {
    let RecurrenceDims {
        groups,
        seq_len,
        features: m,
        ..
    } = dims;
    debug_assert_eq!(q.len(), dims.feature_len());
    debug_assert_eq!(k.len(), dims.feature_len());

    let mut out = vec![0f64; groups * seq_len];
    let mut state = vec![0f64; m];
    for g in 0..groups {
        state.fill(0.0);
        for t in 0..seq_len {
            let at = (g * seq_len + t) * m;
            for (s, &k_val) in state.iter_mut().zip(&k[at..][..m]) {
                *s += k_val;
            }
            out[g * seq_len + t] = dot(&q[at..][..m], &state);
        }
    }
    out
}

/// Sum of prime keys per group, `[groups, features]`.
pub fn denominator_final_state(k: &[f64], dims: RecurrenceDims) -> Vec<f64> {
    let RecurrenceDims {
        groups,
        seq_len,
        features: m,
        ..
    } = dims;
    let mut states = vec![0f64; groups * m];
    for (g, state) in states.chunks_exact_mut(m).enumerate() {
        for t in 0..seq_len {
            for (s, &k_val) in state.iter_mut().zip(&k[(g * seq_len + t) * m..][..m]) {
                *s += k_val;
            }
        }
    }
    states
}

/// Gradients of the denominator with respect to `(q', k')`.
pub fn denominator_backward(
    q: &[f64],
    k: &[f64],
    final_state: &[f64],
    grad: &[f64],
    dims: RecurrenceDims,
) -> (Vec<f64>, Vec<f64>) {
    let RecurrenceDims {
        groups,
        seq_len,
        features: m,
        ..
    } = dims;
    let mut grad_q = vec![0f64; dims.feature_len()];
    let mut grad_k = vec![0f64; dims.feature_len()];

    let mut running = vec![0f64; m];
    let mut adjoint = vec![0f64; m];
    for g in 0..groups {
        running.copy_from_slice(&final_state[g * m..][..m]);
        adjoint.fill(0.0);
        for t in (0..seq_len).rev() {
            let at = (g * seq_len + t) * m;
            let g_t = grad[g * seq_len + t];
            for (gq, &r) in grad_q[at..][..m].iter_mut().zip(&running) {
                *gq = r * g_t;
            }
            for (a, &q_val) in adjoint.iter_mut().zip(&q[at..][..m]) {
                *a += q_val * g_t;
            }
            grad_k[at..][..m].copy_from_slice(&adjoint);
            for (r, &k_val) in running.iter_mut().zip(&k[at..][..m]) {
                *r -= k_val;
            }
        }
    }
    (grad_q, grad_k)
}

/// `state += sign * a bᵀ` for a row-major `a.len() x b.len()` state.
fn add_outer(state: &mut [f64], a: &[f64], b: &[f64], sign: f64) {
    for (row, &a_val) in state.chunks_exact_mut(b.len()).zip(a) {
        let scaled = sign * a_val;
        for (s, &b_val) in row.iter_mut().zip(b) {
            *s += scaled * b_val;
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
