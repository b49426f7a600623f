#![allow(dead_code)]

use candle_core::{DType, Result, Tensor};

/// Numerical floor matched to the working precision.
pub fn dtype_eps(dtype: DType) -> f64 {
    match dtype {
        DType::F16 | DType::BF16 => 1e-4,
        _ => 1e-6,
    }
}

/// Perturb inputs with uniform quantization noise (1/256 of a level).
pub fn add_quantization_noise(x: &Tensor) -> Result<Tensor> {
    x + x.rand_like(0.0, 1.0 / 256.0)?
}

/// Reconcile prediction/target spatial sizes by upsampling the smaller one.
///
/// Mismatches are a recovery case, not an error: rank-4 tensors are resized
/// on their spatial dims to the larger of the two. Equal shapes pass through.
pub fn ensure_same_size(prediction: &Tensor, target: &Tensor) -> Result<(Tensor, Tensor)> {
    if prediction.dims() == target.dims() {
        return Ok((prediction.clone(), target.clone()));
    }
    if prediction.rank() != 4 || target.rank() != 4 {
        candle_core::bail!(
            "size mismatch without spatial dims: {:?} vs {:?}",
            prediction.dims(),
            target.dims()
        );
    }

    let (ph, pw) = (prediction.dim(2)?, prediction.dim(3)?);
    let (th, tw) = (target.dim(2)?, target.dim(3)?);
    if ph * pw < th * tw {
        Ok((prediction.upsample_nearest2d(th, tw)?, target.clone()))
    } else {
        Ok((prediction.clone(), target.upsample_nearest2d(ph, pw)?))
    }
}
