mod common;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use common::{host, max_abs_diff, wave};
use performer_attention::{
    AttentionConfig, AttentionError, KernelType, PerformerAttention, ShortSequenceBehavior,
};

fn relu_config(causal: bool) -> AttentionConfig {
    AttentionConfig {
        kernel_type: KernelType::Relu,
        causal,
        seed: Some(7),
        attention_dropout: 0.0,
        ..AttentionConfig::new(8, 2)
    }
}

fn inputs(len: usize, phase: f64) -> Result<Tensor> {
    Ok(wave(&[1, len, 8], phase, 1.0, &Device::Cpu)?.to_dtype(DType::F32)?)
}

#[test]
fn relu_self_attention_with_full_mask() -> Result<()> {
    let mut attention = PerformerAttention::new(&relu_config(false), &Device::Cpu, DType::F32)?;
    let x = inputs(4, 0.0)?;
    let mask = Tensor::ones((1, 4), DType::F32, &Device::Cpu)?;
    let masked = attention.forward(&x, &x, &x, Some(&mask), None, false)?;
    assert_eq!(masked.context.dims(), &[1, 4, 8]);
    assert!(host(&masked.context)?.iter().all(|x| x.is_finite()));

    // An all-ones mask is the same as no mask.
    let unmasked = attention.forward(&x, &x, &x, None, None, false)?;
    let diff = max_abs_diff(&host(&masked.context)?, &host(&unmasked.context)?);
    assert!(diff < 1e-6);
    Ok(())
}

#[test]
fn causal_outputs_ignore_later_values() -> Result<()> {
    let mut attention = PerformerAttention::new(&relu_config(true), &Device::Cpu, DType::F32)?;
    let x = inputs(4, 0.0)?;
    let before = attention.forward(&x, &x, &x, None, None, false)?.context;

    let value = x.slice_assign(&[0..1, 2..3, 0..8], &inputs(1, 5.0)?)?;
    let after = attention.forward(&x, &x, &value, None, None, false)?.context;

    let prefix = max_abs_diff(
        &host(&before.narrow(1, 0, 2)?)?,
        &host(&after.narrow(1, 0, 2)?)?,
    );
    assert!(prefix < 1e-6, "earlier positions changed by {prefix}");
    let changed = max_abs_diff(
        &host(&before.narrow(1, 2, 2)?)?,
        &host(&after.narrow(1, 2, 2)?)?,
    );
    assert!(changed > 1e-6);
    Ok(())
}

#[test]
fn feature_matrix_changes_every_interval() -> Result<()> {
    let config = AttentionConfig {
        feature_redraw_interval: Some(3),
        ..relu_config(false)
    };
    let mut attention = PerformerAttention::new(&config, &Device::Cpu, DType::F32)?;
    let x = inputs(5, 0.3)?;
    let mut versions = Vec::new();
    let mut matrices = Vec::new();
    for _ in 0..10 {
        attention.forward(&x, &x, &x, None, None, false)?;
        let matrix = attention.feature_matrix().expect("features drawn");
        versions.push(matrix.version);
        matrices.push(host(&matrix.tensor)?);
    }
    assert_eq!(versions, vec![1, 1, 1, 2, 2, 2, 3, 3, 3, 4]);
    for pair in matrices.windows(2).zip(versions.windows(2)) {
        let (m, v) = pair;
        let same = max_abs_diff(&m[0], &m[1]) == 0.0;
        assert_eq!(same, v[0] == v[1]);
    }
    Ok(())
}

#[test]
fn seeded_modules_are_reproducible() -> Result<()> {
    let x = inputs(6, 1.1)?;
    let run = || -> Result<Vec<f64>> {
        let config = AttentionConfig {
            use_qkv_linear_layers: false,
            ..relu_config(false)
        };
        let mut attention = PerformerAttention::new(&config, &Device::Cpu, DType::F32)?;
        let features = {
            attention.forward(&x, &x, &x, None, None, false)?;
            host(&attention.feature_matrix().expect("features").tensor)?
        };
        Ok(features)
    };
    assert_eq!(run()?, run()?);
    Ok(())
}

#[test]
fn favor_path_cannot_return_weights() -> Result<()> {
    let config = AttentionConfig {
        short_sequence_behavior: Some(ShortSequenceBehavior::NeverUseSoftmax),
        seed: Some(3),
        ..AttentionConfig::new(8, 2)
    };
    let mut attention = PerformerAttention::new(&config, &Device::Cpu, DType::F32)?;
    attention.set_training(false);
    let x = inputs(4, 0.0)?;
    let err = attention
        .forward(&x, &x, &x, None, None, true)
        .expect_err("weights are unavailable");
    assert!(matches!(err, AttentionError::UnsupportedConfiguration(_)));
    // Rejected before any feature matrix is drawn.
    assert!(attention.feature_matrix().is_none());
    Ok(())
}

#[test]
fn default_policy_switches_on_training_mode() -> Result<()> {
    let config = AttentionConfig {
        seed: Some(11),
        attention_dropout: 0.0,
        ..AttentionConfig::new(8, 2)
    };
    let mut attention = PerformerAttention::new(&config, &Device::Cpu, DType::F32)?;
    let x = inputs(4, 0.7)?;
    assert!(attention.is_training());
    assert!(attention.forward(&x, &x, &x, None, None, true).is_err());

    attention.set_training(false);
    let out = attention.forward(&x, &x, &x, None, None, true)?;
    let weights = out.attention_weights.expect("softmax weights");
    assert_eq!(weights.dims(), &[1, 2, 4, 4]);
    let sums = host(&weights.sum(3)?)?;
    assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
    Ok(())
}

#[test]
fn padded_keys_do_not_influence_favor_outputs() -> Result<()> {
    let mut attention = PerformerAttention::new(&relu_config(false), &Device::Cpu, DType::F32)?;
    let query = inputs(3, 0.2)?;
    let keys = inputs(5, 1.3)?;
    let mask = Tensor::new(&[[1f32, 1.0, 1.0, 0.0, 0.0]], &Device::Cpu)?;
    let padded = attention.forward(&query, &keys, &keys, Some(&mask), None, false)?;

    let noise = keys.slice_assign(&[0..1, 3..5, 0..8], &inputs(2, 9.0)?)?;
    let perturbed = attention.forward(&query, &noise, &noise, Some(&mask), None, false)?;
    let diff = max_abs_diff(&host(&padded.context)?, &host(&perturbed.context)?);
    assert!(diff < 1e-5, "padded keys moved outputs by {diff}");
    Ok(())
}

#[test]
fn projection_gradients_flow_through_causal_kernel() -> Result<()> {
    let config = AttentionConfig {
        causal: true,
        short_sequence_behavior: Some(ShortSequenceBehavior::NeverUseSoftmax),
        seed: Some(21),
        ..AttentionConfig::new(8, 2)
    };
    let mut attention = PerformerAttention::new(&config, &Device::Cpu, DType::F32)?;
    let x = inputs(6, 0.4)?;
    let out = attention.forward(&x, &x, &x, None, None, false)?;
    let grads = out.context.sqr()?.sum_all()?.backward()?;
    for var in attention.vars() {
        let grad = grads.get(var.as_tensor()).expect("every projection is trained");
        assert!(host(grad)?.iter().all(|g| g.is_finite()));
    }
    Ok(())
}
