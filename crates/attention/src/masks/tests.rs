use super::*;
use candle_core::{DType, Device, Result, Tensor};

fn idx(b: usize, q: usize, k: usize, q_len: usize, k_len: usize) -> usize {
    ((b * q_len) + q) * k_len + k
}

#[test]
fn causal_mask_respects_offsets() -> Result<()> {
    let device = Device::Cpu;
    let (q_len, k_len) = (3, 5);

    let mask = build_causal_mask(&device, q_len, k_len)?;
    assert_eq!(mask.dims(), &[1, 1, q_len, k_len]);
    assert_eq!(mask.dtype(), MASK_DTYPE);

    let values = mask.flatten_all()?.to_vec1::<f32>()?;
    // Earliest query can only see the prefix (offset = k_len - q_len).
    assert_eq!(values[idx(0, 0, 2, q_len, k_len)], 0.0);
    assert_eq!(values[idx(0, 0, 3, q_len, k_len)], f32::NEG_INFINITY);
    // The last query sees everything.
    assert_eq!(values[idx(0, 2, 4, q_len, k_len)], 0.0);

    Ok(())
}

#[test]
fn square_causal_mask_is_lower_triangular() -> Result<()> {
    let device = Device::Cpu;
    let mask = build_causal_mask(&device, 4, 4)?;
    let values = mask.flatten_all()?.to_vec1::<f32>()?;
    for q in 0..4 {
        for k in 0..4 {
            let expected = if k <= q { 0.0 } else { f32::NEG_INFINITY };
            assert_eq!(values[idx(0, q, k, 4, 4)], expected);
        }
    }

    let single = build_causal_mask(&device, 1, 1)?;
    assert_eq!(single.flatten_all()?.to_vec1::<f32>()?, vec![0.0]);
    Ok(())
}

#[test]
fn additive_key_mask_blocks_padded_keys() -> Result<()> {
    let device = Device::Cpu;
    let attend = Tensor::new(&[[1u8, 0, 1], [0, 0, 1]], &device)?;
    let mask = additive_key_mask(&attend)?;
    assert_eq!(mask.dims(), &[2, 1, 1, 3]);
    assert_eq!(mask.dtype(), MASK_DTYPE);
    let values = mask.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(
        values,
        vec![
            0.0,
            f32::NEG_INFINITY,
            0.0,
            f32::NEG_INFINITY,
            f32::NEG_INFINITY,
            0.0
        ]
    );
    Ok(())
}

#[test]
fn key_multiplier_treats_any_nonzero_as_attend() -> Result<()> {
    let device = Device::Cpu;
    let attend = Tensor::new(&[[2.5f32, 0.0, -1.0]], &device)?;
    let multiplier = key_mask_multiplier(&attend, DType::F64)?;
    assert_eq!(multiplier.dims(), &[1, 1, 3, 1]);
    assert_eq!(multiplier.flatten_all()?.to_vec1::<f64>()?, vec![1.0, 0.0, 1.0]);
    Ok(())
}

#[test]
fn key_mask_shape_is_validated() -> Result<()> {
    let device = Device::Cpu;
    let mask = Tensor::ones((2, 4), DType::F32, &device)?;
    assert!(validate_key_mask(&mask, 2, 4).is_ok());
    assert!(validate_key_mask(&mask, 1, 4).is_err());
    assert!(validate_key_mask(&mask.reshape((2, 1, 4))?, 2, 4).is_err());
    Ok(())
}
