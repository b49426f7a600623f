use std::str::FromStr;
use std::sync::Arc;

use candle_core::{DType, Device, Result};

/// Latent reparameterization family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReparamKind {
    IsotropicGaussian,
    Discrete,
}

impl FromStr for ReparamKind {
    type Err = candle_core::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "isotropic_gaussian" | "gaussian" => Ok(Self::IsotropicGaussian),
            "discrete" | "gumbel" => Ok(Self::Discrete),
            other => candle_core::bail!("unknown reparameterization type: {}", other),
        }
    }
}

/// Reconstruction likelihood family.
///
/// `Bernoulli` is variance-free; `Gaussian` and `Laplace` carry a log-scale
/// head, doubling the decoder's final feature dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikelihoodKind {
    Bernoulli,
    Gaussian,
    Laplace,
}

impl FromStr for LikelihoodKind {
    type Err = candle_core::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "bernoulli" => Ok(Self::Bernoulli),
            "gaussian" => Ok(Self::Gaussian),
            "laplace" => Ok(Self::Laplace),
            other => candle_core::bail!("unknown likelihood type: {}", other),
        }
    }
}

/// How the raw mutual-information tensor is bounded before entering the loss.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MutClampStrategy {
    /// Use the raw value.
    None,
    /// Divide by the L2 norm of the batch vector.
    Norm,
    /// Hard clamp to `[-value, value]`.
    Clamp { value: f64 },
}

impl MutClampStrategy {
    /// Resolve a strategy name; `value` only matters for `"clamp"`.
    pub fn from_flag(name: &str, value: f64) -> Result<Self> {
        match name.trim().to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "norm" => Ok(Self::Norm),
            "clamp" => Ok(Self::Clamp { value }),
            other => candle_core::bail!("unknown mut-info clamp strategy: {}", other),
        }
    }
}

/// Read-only model configuration, shared by reference across all components.
///
/// Construct, `validated()`, then never mutate.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub reparam: ReparamKind,
    /// Width of the unactivated continuous logits (2k: mean + log-variance).
    pub continuous_size: usize,
    /// Number of categories for the discrete latent.
    pub discrete_size: usize,
    /// Hidden width used by the recurrent model and its dense projections.
    pub latent_size: usize,
    pub nll: LikelihoodKind,
    pub activation: candle_nn::Activation,
    /// Weight on the KL term of the loss (beta-VAE).
    pub kl_beta: f64,
    pub continuous_mut_info: f64,
    pub discrete_mut_info: f64,
    pub mut_clamp: MutClampStrategy,
    /// Standard deviation used when sampling the generative prior.
    pub generative_scale_var: f64,
    /// Also constrain the learned prior to the strategy's hyper-prior.
    pub use_prior_kl: bool,
    /// Initialize recurrent state with small Gaussian noise while training.
    pub use_noisy_rnn_state: bool,
    /// Perturb step inputs with quantization noise.
    pub add_input_noise: bool,
    pub max_time_steps: usize,
    /// Temperature anneal interval for the discrete reparameterizer.
    pub anneal_interval: usize,
    pub rnn_layers: usize,
    pub device: Device,
    pub dtype: DType,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            reparam: ReparamKind::IsotropicGaussian,
            continuous_size: 64,
            discrete_size: 10,
            latent_size: 32,
            nll: LikelihoodKind::Bernoulli,
            activation: candle_nn::Activation::Relu,
            kl_beta: 1.0,
            continuous_mut_info: 0.0,
            discrete_mut_info: 0.0,
            mut_clamp: MutClampStrategy::None,
            generative_scale_var: 1.0,
            use_prior_kl: false,
            use_noisy_rnn_state: false,
            add_input_noise: false,
            max_time_steps: 4,
            anneal_interval: 10,
            rnn_layers: 2,
            device: Device::Cpu,
            dtype: DType::F32,
        }
    }
}

impl ModelConfig {
    /// Check structural constraints and freeze the configuration behind an `Arc`.
    pub fn validated(self) -> Result<Arc<Self>> {
        match self.reparam {
            ReparamKind::IsotropicGaussian => {
                if self.continuous_size == 0 || self.continuous_size % 2 != 0 {
                    candle_core::bail!(
                        "continuous_size must be a positive even number, got {}",
                        self.continuous_size
                    );
                }
            }
            ReparamKind::Discrete => {
                if self.discrete_size == 0 {
                    candle_core::bail!("discrete_size must be positive");
                }
            }
        }
        if self.latent_size == 0 {
            candle_core::bail!("latent_size must be positive");
        }
        if self.max_time_steps == 0 {
            candle_core::bail!("max_time_steps must be at least 1");
        }
        if self.anneal_interval == 0 {
            candle_core::bail!("anneal_interval must be at least 1");
        }
        if self.rnn_layers == 0 {
            candle_core::bail!("rnn_layers must be at least 1");
        }
        Ok(Arc::new(self))
    }

    /// True when any mutual-information weight is switched on.
    pub fn mut_info_enabled(&self) -> bool {
        self.continuous_mut_info > 0.0 || self.discrete_mut_info > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_odd_continuous_size() {
        let config = ModelConfig {
            continuous_size: 33,
            ..Default::default()
        };
        assert!(config.validated().is_err());
    }

    #[test]
    fn reject_unknown_option_strings() {
        assert!("mixture_of_experts".parse::<ReparamKind>().is_err());
        assert!("disc_mix_logistic".parse::<LikelihoodKind>().is_err());
        assert!(MutClampStrategy::from_flag("truncate", 1.0).is_err());
    }

    #[test]
    fn parse_known_option_strings() -> Result<()> {
        assert_eq!(
            "isotropic_gaussian".parse::<ReparamKind>()?,
            ReparamKind::IsotropicGaussian
        );
        assert_eq!("discrete".parse::<ReparamKind>()?, ReparamKind::Discrete);
        assert_eq!(
            MutClampStrategy::from_flag(" Clamp ", 2.5)?,
            MutClampStrategy::Clamp { value: 2.5 }
        );
        Ok(())
    }
}
