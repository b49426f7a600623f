use std::sync::Arc;

use candle_core::{Result, Tensor};

use crate::candle_aux_layers::Ema;
use crate::candle_loss_functions::{nan_check_and_break, nll, nll_activation};
use crate::candle_model_config::{LikelihoodKind, ModelConfig, MutClampStrategy};
use crate::candle_model_traits::{
    AutoregressiveSamplerT, DecoderModuleT, EncoderModuleT, LatentParams, Reparameterize,
};
use crate::candle_reparam::Reparameterizer;

/// Decay used for the aggregate-posterior moving average.
pub const AGGREGATE_POSTERIOR_DECAY: f64 = 0.999;

/// Posterior record of a single forward pass: the latent parameters plus,
/// when mutual information is enabled, the parameters of the re-encoded
/// reconstruction `q(z|x_hat)`.
#[derive(Debug, Clone)]
pub struct VaeParams {
    pub latent: LatentParams,
    pub q_z_given_xhat: Option<LatentParams>,
}

/// Options for synthetic sample generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateConfig {
    /// Sample from the aggregate-posterior EMA instead of the raw prior.
    pub use_aggregate_posterior: bool,
    /// Re-initialize recurrent state before generating (sequential models).
    pub reset_state: bool,
}

/// Loss report of one (batch of) reconstruction(s).
///
/// `loss` keeps the per-sample vector; the remaining members are scalar
/// tensors for monitoring. `elbo_mean` is the unweighted `nll + kld`.
#[derive(Debug, Clone)]
pub struct VaeLossTerms {
    pub loss: Tensor,
    pub loss_mean: Tensor,
    pub elbo_mean: Tensor,
    pub nll_mean: Tensor,
    pub kld_mean: Tensor,
    pub proxy_mean: Tensor,
    pub mut_info_mean: Tensor,
}

impl VaeLossTerms {
    fn add(&self, other: &Self) -> Result<Self> {
        Ok(Self {
            loss: (&self.loss + &other.loss)?,
            loss_mean: (&self.loss_mean + &other.loss_mean)?,
            elbo_mean: (&self.elbo_mean + &other.elbo_mean)?,
            nll_mean: (&self.nll_mean + &other.nll_mean)?,
            kld_mean: (&self.kld_mean + &other.kld_mean)?,
            proxy_mean: (&self.proxy_mean + &other.proxy_mean)?,
            mut_info_mean: (&self.mut_info_mean + &other.mut_info_mean)?,
        })
    }

    fn scale(&self, factor: f64) -> Result<Self> {
        Ok(Self {
            loss: (&self.loss * factor)?,
            loss_mean: (&self.loss_mean * factor)?,
            elbo_mean: (&self.elbo_mean * factor)?,
            nll_mean: (&self.nll_mean * factor)?,
            kld_mean: (&self.kld_mean * factor)?,
            proxy_mean: (&self.proxy_mean * factor)?,
            mut_info_mean: (&self.mut_info_mean * factor)?,
        })
    }

    /// Sum a sequence of per-step losses and divide by the step count.
    pub fn mean_of(terms: &[Self]) -> Result<Self> {
        match terms.split_first() {
            None => candle_core::bail!("cannot aggregate an empty loss sequence"),
            Some((first, rest)) => {
                let mut total = first.clone();
                for t in rest {
                    total = total.add(t)?;
                }
                total.scale(1.0 / terms.len() as f64)
            }
        }
    }
}

/// Bound the mutual-information tensor according to the configured strategy.
pub(crate) fn clamp_mut_info(strategy: MutClampStrategy, mut_info: Tensor) -> Result<Tensor> {
    match strategy {
        MutClampStrategy::None => Ok(mut_info),
        MutClampStrategy::Norm => {
            let norm = mut_info.sqr()?.sum_all()?.sqrt()?;
            mut_info.broadcast_div(&norm)
        }
        MutClampStrategy::Clamp { value } => mut_info.clamp(-value, value),
    }
}

/// Shared loss skeleton: `nll + beta * kld - mut_info` with fatal NaN checks,
/// reporting the unweighted ELBO alongside.
pub(crate) fn elbo_loss_terms(
    kind: LikelihoodKind,
    kl_beta: f64,
    recon_logits: &Tensor,
    x: &Tensor,
    kld: &Tensor,
    mut_info: &Tensor,
    proxy: Option<&Tensor>,
) -> Result<VaeLossTerms> {
    let nll_b = nll(x, recon_logits, kind)?;
    nan_check_and_break(&nll_b, "nll")?;
    nan_check_and_break(kld, "kld")?;

    let elbo = (&nll_b + kld)?;
    let proxy = match proxy {
        Some(p) => p.clone(),
        None => elbo.zeros_like()?,
    };
    let loss = ((&nll_b + (kld * kl_beta)?)? - mut_info)?;

    Ok(VaeLossTerms {
        loss_mean: loss.mean_all()?,
        elbo_mean: elbo.mean_all()?,
        nll_mean: nll_b.mean_all()?,
        kld_mean: kld.mean_all()?,
        proxy_mean: proxy.mean_all()?,
        mut_info_mean: mut_info.mean_all()?,
        loss,
    })
}

/// Variational autoencoder orchestrator.
///
/// Owns the encoder/decoder collaborators behind their traits, the latent
/// reparameterizer (selected once from configuration) and the aggregate
/// posterior EMA. Training vs. evaluation is threaded explicitly through
/// the `train` flag of each call.
pub struct Vae<Enc, Dec>
where
    Enc: EncoderModuleT,
    Dec: DecoderModuleT,
{
    pub config: Arc<ModelConfig>,
    encoder: Enc,
    decoder: Dec,
    reparameterizer: Reparameterizer,
    aggregate_posterior: Ema,
    pixel_sampler: Option<Box<dyn AutoregressiveSamplerT>>,
}

impl<Enc, Dec> Vae<Enc, Dec>
where
    Enc: EncoderModuleT,
    Dec: DecoderModuleT,
{
    pub fn build(encoder: Enc, decoder: Dec, config: Arc<ModelConfig>) -> Result<Self> {
        let reparameterizer = Reparameterizer::from_config(&config)?;
        assert_eq!(encoder.dim_latent(), reparameterizer.input_size());
        assert_eq!(decoder.dim_latent(), reparameterizer.output_size());

        Ok(Self {
            config,
            encoder,
            decoder,
            reparameterizer,
            aggregate_posterior: Ema::new(AGGREGATE_POSTERIOR_DECAY),
            pixel_sampler: None,
        })
    }

    /// Attach the external autoregressive sampler used at generation time
    /// by pixel-level decoders.
    pub fn with_pixel_sampler(mut self, sampler: Box<dyn AutoregressiveSamplerT>) -> Self {
        self.pixel_sampler = Some(sampler);
        self
    }

    pub fn reparameterizer(&self) -> &Reparameterizer {
        &self.reparameterizer
    }

    pub fn reparameterizer_scalars(&self) -> Vec<(&'static str, f64)> {
        self.reparameterizer.scalars()
    }

    pub fn encode(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.encoder.forward_t(x, train)
    }

    pub fn reparameterize(&mut self, logits: &Tensor, train: bool) -> Result<(Tensor, LatentParams)> {
        self.reparameterizer.forward_t(logits, train)
    }

    /// Reparameterized q(z|x); feeds the aggregate-posterior EMA in training.
    pub fn posterior(&mut self, x: &Tensor, train: bool) -> Result<(Tensor, LatentParams)> {
        let z_logits = self.encode(x, train)?;
        if train {
            self.aggregate_posterior.update(&z_logits)?;
        }
        self.reparameterize(&z_logits, train)
    }

    pub fn decode(&self, z: &Tensor, train: bool) -> Result<Tensor> {
        self.decoder.forward_t(&z.contiguous()?, train)
    }

    /// Full pass: posterior, decode, and (when mutual information is on)
    /// the posterior of the activated reconstruction.
    pub fn forward_t(&mut self, x: &Tensor, train: bool) -> Result<(Tensor, VaeParams)> {
        let (z, latent) = self.posterior(x, train)?;
        let decoded_logits = self.decode(&z, train)?;
        let q_z_given_xhat = self.compute_mi_params(&decoded_logits, train)?;
        Ok((
            decoded_logits,
            VaeParams {
                latent,
                q_z_given_xhat,
            },
        ))
    }

    /// Second encoder pass over the activated reconstruction; skipped when
    /// no mutual-information weight is configured.
    fn compute_mi_params(&mut self, recon_logits: &Tensor, train: bool) -> Result<Option<LatentParams>> {
        if !self.config.mut_info_enabled() {
            return Ok(None);
        }
        let x_hat = self.nll_activation(recon_logits)?;
        let (_z, params) = self.posterior(&x_hat, train)?;
        Ok(Some(params))
    }

    pub fn nll_activation(&self, recon_logits: &Tensor) -> Result<Tensor> {
        nll_activation(recon_logits, self.config.nll)
    }

    /// KL divergence against the reparameterizer's default prior.
    pub fn kld(&self, latent: &LatentParams) -> Result<Tensor> {
        self.reparameterizer.kl(latent, None)
    }

    /// Clamped, weighted mutual information; zero when disabled or when no
    /// re-encoded posterior is available.
    pub fn mut_info(&self, params: &VaeParams, batch_size: usize) -> Result<Tensor> {
        let zeros = Tensor::zeros(batch_size, self.config.dtype, &self.config.device)?;
        if !self.config.mut_info_enabled() {
            return Ok(zeros);
        }
        match &params.q_z_given_xhat {
            None => Ok(zeros),
            Some(recoded) => {
                let raw = self.reparameterizer.mutual_info(&params.latent, recoded)?;
                clamp_mut_info(self.config.mut_clamp, raw)
            }
        }
    }

    /// ELBO-style loss with the mutual-information and proxy terms.
    pub fn loss_function(&self, recon_logits: &Tensor, x: &Tensor, params: &VaeParams) -> Result<VaeLossTerms> {
        let kld = self.kld(&params.latent)?;
        let mut_info = self.mut_info(params, x.dim(0)?)?;
        let proxy = self.reparameterizer.proxy_loss()?;
        elbo_loss_terms(
            self.config.nll,
            self.config.kl_beta,
            recon_logits,
            x,
            &kld,
            &mut_info,
            proxy.as_ref(),
        )
    }

    /// Decode samples drawn from the raw prior, or from the aggregate
    /// posterior EMA when requested. Pixel-level decoders hand the decoded
    /// logits to the external autoregressive sampler.
    pub fn generate_synthetic_samples(
        &mut self,
        batch_size: usize,
        generate: &GenerateConfig,
    ) -> Result<Tensor> {
        let z_samples = if generate.use_aggregate_posterior {
            let ema_logits = match self.aggregate_posterior.value() {
                Some(v) => v.clone(),
                None => candle_core::bail!("aggregate posterior has not been fed yet"),
            };
            self.reparameterize(&ema_logits, false)?.0
        } else {
            self.reparameterizer
                .prior(batch_size, self.config.generative_scale_var)?
        };

        let decoded = self.decode(&z_samples, false)?;
        match &self.pixel_sampler {
            Some(sampler) => sampler.sample(&decoded),
            None => self.nll_activation(&decoded),
        }
    }
}
