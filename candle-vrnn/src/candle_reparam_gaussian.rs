use std::sync::Arc;

use candle_core::{Result, Tensor};

use crate::candle_aux_module::dtype_eps;
use crate::candle_loss_functions::{gaussian_kl_between, gaussian_kl_loss, nan_check_and_break};
use crate::candle_model_config::ModelConfig;
use crate::candle_model_traits::{GaussianParams, LatentParams, Reparameterize};

/// Isotropic Gaussian reparameterization.
///
/// Consumes unactivated logits of even width `2k`, using the first half as
/// the mean and the second half (plus a small numerical floor) as the
/// log-variance. Training-mode samples use the reparameterization trick,
/// evaluation returns the mean.
pub struct IsotropicGaussian {
    config: Arc<ModelConfig>,
    input_size: usize,
    output_size: usize,
}

impl IsotropicGaussian {
    pub fn new(config: Arc<ModelConfig>) -> Result<Self> {
        if config.continuous_size % 2 != 0 {
            candle_core::bail!(
                "continuous_size must be even, got {}",
                config.continuous_size
            );
        }
        let input_size = config.continuous_size;
        let output_size = config.continuous_size / 2;
        Ok(Self {
            config,
            input_size,
            output_size,
        })
    }

    /// Split logits into (mu, logvar) halves along the feature axis.
    /// Supports 2D `[batch, 2k]` and 3D `[batch, time, 2k]` inputs.
    fn split_logits(&self, logits: &Tensor) -> Result<(Tensor, Tensor)> {
        let last = match logits.rank() {
            2 => 1,
            3 => 2,
            r => candle_core::bail!("unsupported rank {} for gaussian reparameterization", r),
        };
        let feature_size = logits.dim(last)?;
        if feature_size % 2 != 0 || feature_size / 2 != self.output_size {
            candle_core::bail!(
                "gaussian logits width {} does not match continuous_size {}",
                feature_size,
                self.input_size
            );
        }
        let eps = dtype_eps(logits.dtype());
        let mu = logits.narrow(last, 0, feature_size / 2)?;
        let logvar = (logits.narrow(last, feature_size / 2, feature_size / 2)? + eps)?;
        Ok((mu, logvar))
    }

    /// z = mu + exp(0.5 * logvar) * eps with eps ~ N(0, 1), fresh per call.
    fn reparameterize_gaussian(&self, mu: &Tensor, logvar: &Tensor, train: bool) -> Result<Tensor> {
        if train {
            nan_check_and_break(logvar, "logvar")?;
            let eps = Tensor::randn_like(mu, 0., 1.)?;
            mu + (logvar * 0.5)?.exp()? * eps
        } else {
            Ok(mu.clone())
        }
    }
}

impl Reparameterize for IsotropicGaussian {
    fn input_size(&self) -> usize {
        self.input_size
    }

    fn output_size(&self) -> usize {
        self.output_size
    }

    fn forward_t(&mut self, logits: &Tensor, train: bool) -> Result<(Tensor, LatentParams)> {
        let (mu, logvar) = self.split_logits(logits)?;
        nan_check_and_break(&mu, "mu")?;
        let z = self.reparameterize_gaussian(&mu, &logvar, train)?;
        let params = GaussianParams {
            mu_mean: mu.mean_all()?,
            logvar_mean: logvar.mean_all()?,
            mu,
            logvar,
        };
        Ok((z, LatentParams::Gaussian(params)))
    }

    fn prior(&self, batch_size: usize, scale_var: f64) -> Result<Tensor> {
        Tensor::randn(
            0f32,
            scale_var as f32,
            (batch_size, self.output_size),
            &self.config.device,
        )?
        .to_dtype(self.config.dtype)
    }

    fn kl(&self, dist_a: &LatentParams, prior: Option<&LatentParams>) -> Result<Tensor> {
        let a = dist_a.gaussian()?;
        match prior {
            None => gaussian_kl_loss(&a.mu, &a.logvar),
            Some(p) => {
                let p = p.gaussian()?;
                gaussian_kl_between(&a.mu, &a.logvar, &p.mu, &p.logvar)
            }
        }
    }

    /// I(z; x) ~ KL(q(z|x_hat) || q(z|x)), scaled by the configured weight.
    fn mutual_info(&self, posterior: &LatentParams, recoded: &LatentParams) -> Result<Tensor> {
        let weight = self.config.continuous_mut_info;
        let q = posterior.gaussian()?;
        if weight == 0.0 {
            let batch_size = q.mu.dim(0)?;
            return Tensor::zeros(batch_size, q.mu.dtype(), q.mu.device());
        }
        let q_hat = recoded.gaussian()?;
        gaussian_kl_between(&q_hat.mu, &q_hat.logvar, &q.mu, &q.logvar)? * weight
    }

    fn log_likelihood(&self, z: &Tensor, params: &LatentParams) -> Result<Tensor> {
        let p = params.gaussian()?;
        // elementwise log N(z; mu, exp(logvar))
        let sq = z.sub(&p.mu)?.powf(2.)?.div(&p.logvar.exp()?)?;
        ((sq + &p.logvar)? + (2.0 * std::f64::consts::PI).ln())? * (-0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_model_config::ReparamKind;
    use candle_core::{DType, Device};

    fn gaussian_config() -> Result<Arc<ModelConfig>> {
        ModelConfig {
            reparam: ReparamKind::IsotropicGaussian,
            continuous_size: 8,
            ..Default::default()
        }
        .validated()
    }

    #[test]
    fn reject_unsupported_rank() -> Result<()> {
        let mut reparam = IsotropicGaussian::new(gaussian_config()?)?;
        let logits = Tensor::zeros((2, 2, 2, 8), DType::F32, &Device::Cpu)?;
        assert!(reparam.forward_t(&logits, true).is_err());
        Ok(())
    }

    #[test]
    fn nan_logvar_is_fatal() -> Result<()> {
        let mut reparam = IsotropicGaussian::new(gaussian_config()?)?;
        let mu = Tensor::zeros((2, 4), DType::F32, &Device::Cpu)?;
        let bad = Tensor::new(&[[f32::NAN; 4]; 2], &Device::Cpu)?;
        let logits = Tensor::cat(&[&mu, &bad], 1)?;
        assert!(reparam.forward_t(&logits, true).is_err());
        Ok(())
    }
}
