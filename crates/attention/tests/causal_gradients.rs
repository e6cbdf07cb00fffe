mod common;

use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};
use common::{host, max_abs_diff, positive_wave, wave};
use performer_attention::{CausalAttention, LinearAggregation};

/// Per-position prefix-sum loop built from ordinary differentiable ops.
fn unrolled(q: &Tensor, k: &Tensor, v: &Tensor, normalize: bool) -> Result<Tensor> {
    let (batch, heads, len, m) = q.dims4()?;
    let dv = v.dim(3)?;
    let mut state = Tensor::zeros((batch, heads, m, dv), DType::F64, q.device())?;
    let mut key_sum = Tensor::zeros((batch, heads, 1, m), DType::F64, q.device())?;
    let mut rows = Vec::with_capacity(len);
    for t in 0..len {
        let q_t = q.narrow(2, t, 1)?.contiguous()?;
        let k_t = k.narrow(2, t, 1)?.contiguous()?;
        let v_t = v.narrow(2, t, 1)?.contiguous()?;
        state = (state + k_t.transpose(2, 3)?.contiguous()?.matmul(&v_t)?)?;
        let mut row = q_t.matmul(&state)?;
        if normalize {
            key_sum = (key_sum + &k_t)?;
            let denominator = (&q_t * &key_sum)?.sum_keepdim(3)?;
            row = row.broadcast_div(&denominator)?;
        }
        rows.push(row);
    }
    Ok(Tensor::cat(&rows, 2)?)
}

fn weighted_loss(out: &Tensor, weights: &Tensor) -> Result<Tensor> {
    Ok((out * weights)?.sum_all()?)
}

#[test]
fn gradients_match_unrolled_recurrence() -> Result<()> {
    let device = Device::Cpu;
    let (batch, heads, len, m, dv) = (2, 2, 6, 5, 3);
    let q = Var::from_tensor(&positive_wave(&[batch, heads, len, m], 0.2, &device)?)?;
    let k = Var::from_tensor(&positive_wave(&[batch, heads, len, m], 1.4, &device)?)?;
    let v = Var::from_tensor(&wave(&[batch, heads, len, dv], 2.6, 1.0, &device)?)?;
    let weights = wave(&[batch, heads, len, dv], 0.9, 1.0, &device)?;

    for normalize in [false, true] {
        let fused = CausalAttention::new(normalize, 1e-6).aggregate(&q, &k, &v, None)?;
        let fused_grads = weighted_loss(&fused, &weights)?.backward()?;
        let reference = unrolled(&q, &k, &v, normalize)?;
        let reference_grads = weighted_loss(&reference, &weights)?.backward()?;

        assert!(max_abs_diff(&host(&fused)?, &host(&reference)?) < 1e-10);
        for (name, var) in [("q", &q), ("k", &k), ("v", &v)] {
            let got = fused_grads.get(var.as_tensor()).expect("fused gradient");
            let want = reference_grads.get(var.as_tensor()).expect("reference gradient");
            let diff = max_abs_diff(&host(got)?, &host(want)?);
            assert!(diff < 1e-9, "{name} gradient differs by {diff} (normalize={normalize})");
        }
    }
    Ok(())
}

#[test]
fn gradients_match_finite_differences() -> Result<()> {
    let device = Device::Cpu;
    let dims = [1usize, 1, 4, 3];
    let value_dims = [1usize, 1, 4, 2];
    let q0 = positive_wave(&dims, 0.6, &device)?;
    let k0 = positive_wave(&dims, 1.8, &device)?;
    let v0 = wave(&value_dims, 0.3, 1.0, &device)?;
    let weights = wave(&value_dims, 1.2, 1.0, &device)?;
    let attention = CausalAttention::new(true, 1e-6);

    let loss = |q: &Tensor, k: &Tensor, v: &Tensor| -> Result<f64> {
        let out = attention.aggregate(q, k, v, None)?;
        Ok(weighted_loss(&out, &weights)?.to_scalar::<f64>()?)
    };

    let q = Var::from_tensor(&q0)?;
    let k = Var::from_tensor(&k0)?;
    let v = Var::from_tensor(&v0)?;
    let out = attention.aggregate(&q, &k, &v, None)?;
    let grads = weighted_loss(&out, &weights)?.backward()?;

    let step = 1e-6;
    for which in 0..3 {
        let base = [&q0, &k0, &v0][which];
        let analytic = host(grads.get([&q, &k, &v][which].as_tensor()).expect("gradient"))?;
        let values = host(base)?;
        for i in 0..values.len() {
            let nudged = |delta: f64| -> Result<Tensor> {
                let mut data = values.clone();
                data[i] += delta;
                Ok(Tensor::from_vec(data, base.dims(), &device)?)
            };
            let mut inputs_up = [q0.clone(), k0.clone(), v0.clone()];
            let mut inputs_down = inputs_up.clone();
            inputs_up[which] = nudged(step)?;
            inputs_down[which] = nudged(-step)?;
            let numeric = (loss(&inputs_up[0], &inputs_up[1], &inputs_up[2])?
                - loss(&inputs_down[0], &inputs_down[1], &inputs_down[2])?)
                / (2.0 * step);
            assert!(
                (numeric - analytic[i]).abs() < 1e-6,
                "input {which} element {i}: numeric {numeric} vs analytic {}",
                analytic[i]
            );
        }
    }
    Ok(())
}

#[test]
fn masked_keys_receive_no_gradient() -> Result<()> {
    let device = Device::Cpu;
    let k = Var::from_tensor(&positive_wave(&[1, 1, 4, 3], 0.4, &device)?)?;
    let v = Var::from_tensor(&wave(&[1, 1, 4, 2], 1.0, 1.0, &device)?)?;
    let q = positive_wave(&[1, 1, 4, 3], 2.2, &device)?;
    let multiplier = Tensor::new(&[1f64, 1.0, 0.0, 1.0], &device)?.reshape((1, 1, 4, 1))?;
    let out = CausalAttention::new(true, 1e-6).aggregate(&q, &k, &v, Some(&multiplier))?;
    let grads = out.sum_all()?.backward()?;
    let k_grad = grads.get(k.as_tensor()).expect("key gradient").narrow(2, 2, 1)?;
    let v_grad = grads.get(v.as_tensor()).expect("value gradient").narrow(2, 2, 1)?;
    assert!(host(&k_grad)?.iter().all(|g| *g == 0.0));
    assert!(host(&v_grad)?.iter().all(|g| *g == 0.0));
    Ok(())
}
