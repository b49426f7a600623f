#![allow(dead_code)]

use candle_core::{Result, Tensor};

pub trait EncoderModuleT {
    /// An encoder that maps observations to unactivated latent logits
    ///
    /// # Arguments
    /// * `x_nd` - input data (n x d), flattened internally if needed
    /// * `train` - whether to use stochastic layers or not
    ///
    /// # Returns `logits_nl`
    /// * `logits_nl` - unactivated logits (n x l), consumed by a reparameterizer
    fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<Tensor>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}

pub trait DecoderModuleT {
    /// A decoder that maps a latent sample to unactivated reconstruction
    /// logits; variance-bearing likelihoods double the feature width
    /// (location followed by log-scale).
    fn forward_t(&self, z_nk: &Tensor, train: bool) -> Result<Tensor>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}

/// External autoregressive sampler contract.
///
/// Implementors refine decoded logits pixel by pixel in raster-scan order,
/// channel by channel, synchronizing the device after each pixel when
/// running on an accelerator. This crate only consumes the interface.
pub trait AutoregressiveSamplerT {
    fn sample(&self, decoded_logits: &Tensor) -> Result<Tensor>;
}

/// Parameter record produced by the Gaussian reparameterizer.
#[derive(Debug, Clone)]
pub struct GaussianParams {
    pub mu: Tensor,
    pub logvar: Tensor,
    pub mu_mean: Tensor,
    pub logvar_mean: Tensor,
}

/// Parameter record produced by the discrete (Gumbel-softmax) reparameterizer.
#[derive(Debug, Clone)]
pub struct DiscreteParams {
    pub logits: Tensor,
    pub log_q_z: Tensor,
    pub z_soft: Tensor,
    pub z_hard: Tensor,
    pub tau: f64,
}

/// Strategy-specific parameter record, consumed by the KL, mutual-information
/// and log-likelihood members of the owning reparameterizer. Passing a record
/// of the wrong variant is a structural contract violation and fails with an
/// error rather than being coerced.
#[derive(Debug, Clone)]
pub enum LatentParams {
    Gaussian(GaussianParams),
    Discrete(DiscreteParams),
}

impl LatentParams {
    pub fn gaussian(&self) -> Result<&GaussianParams> {
        match self {
            Self::Gaussian(p) => Ok(p),
            Self::Discrete(_) => {
                candle_core::bail!("expected gaussian parameters, got discrete")
            }
        }
    }

    pub fn discrete(&self) -> Result<&DiscreteParams> {
        match self {
            Self::Discrete(p) => Ok(p),
            Self::Gaussian(_) => {
                candle_core::bail!("expected discrete parameters, got gaussian")
            }
        }
    }
}

/// Capability set of a latent reparameterization strategy.
///
/// Implementors own their prior sampler, divergence formulas and any
/// annealing state; the orchestrators only see this interface.
pub trait Reparameterize {
    /// Width of the unactivated logits this strategy consumes.
    fn input_size(&self) -> usize;

    /// Width of the latent sample this strategy produces.
    fn output_size(&self) -> usize;

    /// Transform unactivated logits into a latent sample and its parameter
    /// record. Stochastic in training mode, deterministic in evaluation.
    fn forward_t(&mut self, logits: &Tensor, train: bool) -> Result<(Tensor, LatentParams)>;

    /// Draw `batch_size` samples from the strategy's default prior.
    fn prior(&self, batch_size: usize, scale_var: f64) -> Result<Tensor>;

    /// KL divergence of `dist_a` against `prior`, or against the strategy's
    /// default prior when `prior` is `None`. Reduced to a batch-size vector.
    fn kl(&self, dist_a: &LatentParams, prior: Option<&LatentParams>) -> Result<Tensor>;

    /// Weighted mutual-information estimate between the posterior and the
    /// posterior of the re-encoded reconstruction.
    fn mutual_info(&self, posterior: &LatentParams, recoded: &LatentParams) -> Result<Tensor>;

    /// Log-likelihood of `z` under the record's distribution.
    fn log_likelihood(&self, z: &Tensor, params: &LatentParams) -> Result<Tensor>;

    /// Extra strategy-specific regularizer, if any.
    fn proxy_loss(&self) -> Result<Option<Tensor>> {
        Ok(None)
    }

    /// Scalars worth monitoring (eg: tau in gumbel).
    fn scalars(&self) -> Vec<(&'static str, f64)> {
        Vec::new()
    }
}
