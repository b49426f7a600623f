use std::sync::Arc;

use candle_core::{Result, Tensor};
use log::info;

use crate::candle_model_config::{ModelConfig, ReparamKind};
use crate::candle_model_traits::{LatentParams, Reparameterize};
use crate::candle_reparam_gaussian::IsotropicGaussian;
use crate::candle_reparam_gumbel::GumbelSoftmax;

/// Closed set of latent reparameterization strategies.
///
/// Selected once at construction from validated configuration; the
/// orchestrators dispatch through this variant for the whole model lifetime.
pub enum Reparameterizer {
    Gaussian(IsotropicGaussian),
    Discrete(GumbelSoftmax),
}

impl Reparameterizer {
    pub fn from_config(config: &Arc<ModelConfig>) -> Result<Self> {
        match config.reparam {
            ReparamKind::IsotropicGaussian => {
                info!("using isotropic gaussian reparameterizer");
                Ok(Self::Gaussian(IsotropicGaussian::new(config.clone())?))
            }
            ReparamKind::Discrete => {
                info!("using gumbel softmax reparameterizer");
                Ok(Self::Discrete(GumbelSoftmax::new(config.clone())?))
            }
        }
    }

    pub fn has_discrete(&self) -> bool {
        matches!(self, Self::Discrete(_))
    }
}

impl Reparameterize for Reparameterizer {
    fn input_size(&self) -> usize {
        match self {
            Self::Gaussian(r) => r.input_size(),
            Self::Discrete(r) => r.input_size(),
        }
    }

    fn output_size(&self) -> usize {
        match self {
            Self::Gaussian(r) => r.output_size(),
            Self::Discrete(r) => r.output_size(),
        }
    }

    fn forward_t(&mut self, logits: &Tensor, train: bool) -> Result<(Tensor, LatentParams)> {
        match self {
            Self::Gaussian(r) => r.forward_t(logits, train),
            Self::Discrete(r) => r.forward_t(logits, train),
        }
    }

    fn prior(&self, batch_size: usize, scale_var: f64) -> Result<Tensor> {
        match self {
            Self::Gaussian(r) => r.prior(batch_size, scale_var),
            Self::Discrete(r) => r.prior(batch_size, scale_var),
        }
    }

    fn kl(&self, dist_a: &LatentParams, prior: Option<&LatentParams>) -> Result<Tensor> {
        match self {
            Self::Gaussian(r) => r.kl(dist_a, prior),
            Self::Discrete(r) => r.kl(dist_a, prior),
        }
    }

    fn mutual_info(&self, posterior: &LatentParams, recoded: &LatentParams) -> Result<Tensor> {
        match self {
            Self::Gaussian(r) => r.mutual_info(posterior, recoded),
            Self::Discrete(r) => r.mutual_info(posterior, recoded),
        }
    }

    fn log_likelihood(&self, z: &Tensor, params: &LatentParams) -> Result<Tensor> {
        match self {
            Self::Gaussian(r) => r.log_likelihood(z, params),
            Self::Discrete(r) => r.log_likelihood(z, params),
        }
    }

    fn proxy_loss(&self) -> Result<Option<Tensor>> {
        match self {
            Self::Gaussian(r) => r.proxy_loss(),
            Self::Discrete(r) => r.proxy_loss(),
        }
    }

    fn scalars(&self) -> Vec<(&'static str, f64)> {
        match self {
            Self::Gaussian(r) => r.scalars(),
            Self::Discrete(r) => r.scalars(),
        }
    }
}
