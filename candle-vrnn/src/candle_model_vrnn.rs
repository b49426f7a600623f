use std::sync::Arc;

use candle_core::{Result, Tensor, D};
use candle_nn::{ops, Linear, Module, VarBuilder};

use crate::candle_aux_layers::{dense_stack, Ema, StackLayers};
use crate::candle_aux_module::{add_quantization_noise, ensure_same_size};
use crate::candle_decoder_dense::DenseDecoder;
use crate::candle_loss_functions::{nan_check_and_break, nll_activation, nll_has_variance};
use crate::candle_model_config::{ModelConfig, ReparamKind};
use crate::candle_model_traits::{
    AutoregressiveSamplerT, DecoderModuleT, LatentParams, Reparameterize,
};
use crate::candle_model_vae::{
    clamp_mut_info, elbo_loss_terms, GenerateConfig, VaeLossTerms, AGGREGATE_POSTERIOR_DECAY,
};
use crate::candle_reparam::Reparameterizer;
use crate::candle_vrnn_memory::VrnnMemory;

/// Unactivated projections of one time step.
pub struct VrnnLogits {
    pub encoder_logits: Tensor,
    pub prior_logits: Tensor,
    pub x_features: Tensor,
}

/// Reparameterized samples of one time step.
pub struct VrnnLatent {
    pub posterior: Tensor,
    pub prior: Tensor,
    pub x_features: Tensor,
}

/// Posterior and learned-prior parameter records of one time step, plus the
/// re-encoded posterior when mutual information is enabled.
#[derive(Debug, Clone)]
pub struct VrnnParams {
    pub posterior: LatentParams,
    pub prior: LatentParams,
    pub q_z_given_xhat: Option<LatentParams>,
}

/// Input of a multi-step unroll.
pub enum RolloutInput {
    /// One observation; the decoded output of step `i` feeds step `i + 1`.
    Single(Tensor),
    /// One observation per time step.
    PerStep(Vec<Tensor>),
}

/// Variational recurrent neural network.
///
/// Threads a latent state through time: each step encodes the input against
/// the current memory trace, reparameterizes posterior and learned prior
/// through the shared strategy, and decodes while advancing the memory.
pub struct Vrnn {
    pub config: Arc<ModelConfig>,
    input_shape: Vec<usize>,
    phi_x: StackLayers<Linear>,
    phi_x_aux: Vec<StackLayers<Linear>>,
    phi_z: StackLayers<Linear>,
    encoder: StackLayers<Linear>,
    prior: StackLayers<Linear>,
    decoder: DenseDecoder,
    memory: VrnnMemory,
    reparameterizer: Reparameterizer,
    aggregate_posterior_encoder: Ema,
    aggregate_posterior_prior: Ema,
    pixel_sampler: Option<Box<dyn AutoregressiveSamplerT>>,
}

impl Vrnn {
    /// Two-phase construction: all shapes derive from the declared input
    /// shapes, every submodule is allocated eagerly. Auxiliary inputs must
    /// be declared here; none may appear later.
    pub fn new(
        input_shape: &[usize],
        aux_input_shapes: &[Vec<usize>],
        config: Arc<ModelConfig>,
        vs: VarBuilder,
    ) -> Result<Self> {
        let reparameterizer = Reparameterizer::from_config(&config)?;
        let latent = config.latent_size;
        let act = config.activation;
        let input_size = input_shape.iter().product::<usize>();
        if input_size == 0 {
            candle_core::bail!("empty input shape");
        }

        // feature-extracting transformations
        let phi_x = dense_stack(
            input_size,
            &[latent],
            latent,
            act,
            Some(act),
            vs.pp("nn.phi_x.0"),
        )?;
        let mut phi_x_aux = Vec::with_capacity(aux_input_shapes.len());
        for (i, shape) in aux_input_shapes.iter().enumerate() {
            let aux_size = shape.iter().product::<usize>();
            if aux_size == 0 {
                candle_core::bail!("empty auxiliary input shape at {}", i);
            }
            phi_x_aux.push(dense_stack(
                aux_size,
                &[latent],
                latent,
                act,
                Some(act),
                vs.pp(format!("nn.phi_x.{}", i + 1)),
            )?);
        }
        let n_features = latent * (1 + aux_input_shapes.len());

        let phi_z = dense_stack(
            reparameterizer.output_size(),
            &[latent],
            latent,
            act,
            Some(candle_nn::Activation::Silu),
            vs.pp("nn.phi_z"),
        )?;

        // posterior encoder over [features, state], prior over state alone
        let encoder = dense_stack(
            n_features + latent,
            &[latent, latent],
            reparameterizer.input_size(),
            act,
            None,
            vs.pp("nn.enc"),
        )?;
        let prior = dense_stack(
            latent,
            &[latent, latent],
            reparameterizer.input_size(),
            act,
            None,
            vs.pp("nn.prior"),
        )?;

        let decoder = DenseDecoder::new(
            latent * 2,
            &[latent],
            input_shape,
            config.nll,
            act,
            vs.pp("nn.dec"),
        )?;

        // memory module consuming [features, phi_z]
        let memory = VrnnMemory::new(
            n_features + latent,
            latent,
            config.rnn_layers,
            config.clone(),
            vs.pp("nn"),
        )?;

        Ok(Self {
            config,
            input_shape: input_shape.to_vec(),
            phi_x,
            phi_x_aux,
            phi_z,
            encoder,
            prior,
            decoder,
            memory,
            reparameterizer,
            aggregate_posterior_encoder: Ema::new(AGGREGATE_POSTERIOR_DECAY),
            aggregate_posterior_prior: Ema::new(AGGREGATE_POSTERIOR_DECAY),
            pixel_sampler: None,
        })
    }

    pub fn with_pixel_sampler(mut self, sampler: Box<dyn AutoregressiveSamplerT>) -> Self {
        self.pixel_sampler = Some(sampler);
        self
    }

    pub fn memory(&self) -> &VrnnMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut VrnnMemory {
        &mut self.memory
    }

    pub fn reparameterizer_scalars(&self) -> Vec<(&'static str, f64)> {
        self.reparameterizer.scalars()
    }

    pub fn has_discrete(&self) -> bool {
        self.reparameterizer.has_discrete()
    }

    fn flatten(x: &Tensor) -> Result<Tensor> {
        if x.rank() > 2 {
            x.flatten_from(1)
        } else {
            Ok(x.clone())
        }
    }

    /// Project the input (and any declared auxiliary inputs) through their
    /// feature extractors, concatenating along the feature axis.
    fn extract_features(&self, x: &Tensor, aux: &[Tensor]) -> Result<Tensor> {
        if aux.len() > self.phi_x_aux.len() {
            candle_core::bail!(
                "{} auxiliary inputs but only {} declared extractors",
                aux.len(),
                self.phi_x_aux.len()
            );
        }
        let mut phi_x_t = self.phi_x.forward(&Self::flatten(x)?)?;
        for (module, x_item) in self.phi_x_aux.iter().zip(aux.iter()) {
            let phi_x_i = module.forward(&Self::flatten(x_item)?)?;
            phi_x_t = Tensor::cat(&[&phi_x_t, &phi_x_i], D::Minus1)?;
        }
        Ok(phi_x_t)
    }

    /// Sigmoid-clamp the variance half of gaussian prior logits so the
    /// learned prior cannot explode; discrete logits pass through.
    fn clamp_variance(&self, logits: &Tensor) -> Result<Tensor> {
        match self.config.reparam {
            ReparamKind::IsotropicGaussian => {
                let feat_size = logits.dim(D::Minus1)?;
                let mu = logits.narrow(D::Minus1, 0, feat_size / 2)?;
                let var = ops::sigmoid(&logits.narrow(D::Minus1, feat_size / 2, feat_size / 2)?)?;
                Tensor::cat(&[&mu, &var], D::Minus1)
            }
            ReparamKind::Discrete => Ok(logits.clone()),
        }
    }

    /// Posterior and prior projections against the current memory trace.
    pub fn encode(&self, x: &Tensor, aux: &[Tensor]) -> Result<VrnnLogits> {
        let state_mean = self.memory.mean_state_hidden()?;
        nan_check_and_break(&state_mean, "final_rnn_output")?;

        let phi_x_t = self.extract_features(x, aux)?;

        let enc_input_t = Tensor::cat(&[&phi_x_t, &state_mean], D::Minus1)?;
        let enc_t = self.encoder.forward(&enc_input_t)?;
        nan_check_and_break(&enc_t, "enc_t")?;

        let prior_t = self.prior.forward(&state_mean.contiguous()?)?;
        nan_check_and_break(&prior_t, "prior_t")?;

        Ok(VrnnLogits {
            encoder_logits: enc_t,
            prior_logits: prior_t,
            x_features: phi_x_t,
        })
    }

    /// Reparameterize the encoder output and the (variance-clamped) prior
    /// through the shared strategy.
    pub fn reparameterize(
        &mut self,
        logits: &VrnnLogits,
        train: bool,
    ) -> Result<(VrnnLatent, VrnnParams)> {
        let (z_enc_t, params_enc_t) = self
            .reparameterizer
            .forward_t(&logits.encoder_logits, train)?;

        let prior_logits = self.clamp_variance(&logits.prior_logits)?;
        let (z_prior_t, params_prior_t) = self.reparameterizer.forward_t(&prior_logits, train)?;

        Ok((
            VrnnLatent {
                posterior: z_enc_t,
                prior: z_prior_t,
                x_features: logits.x_features.clone(),
            },
            VrnnParams {
                posterior: params_enc_t,
                prior: params_prior_t,
                q_z_given_xhat: None,
            },
        ))
    }

    /// q(z|x, h): encode, feed the EMAs in training mode, reparameterize.
    pub fn posterior(
        &mut self,
        x: &Tensor,
        aux: &[Tensor],
        train: bool,
    ) -> Result<(VrnnLatent, VrnnParams)> {
        let logits = self.encode(x, aux)?;
        if train {
            self.aggregate_posterior_encoder
                .update(&logits.encoder_logits)?;
            self.aggregate_posterior_prior.update(&logits.prior_logits)?;
        }
        self.reparameterize(&logits, train)
    }

    /// Advance the memory with `[x_features, phi_z]`; when `produce_output`
    /// is set, also decode `[phi_z, state]` against the pre-update state.
    pub fn decode_step(
        &mut self,
        z: &VrnnLatent,
        produce_output: bool,
        train: bool,
    ) -> Result<Option<Tensor>> {
        let state_mean = self.memory.mean_state_hidden()?;

        let phi_z_t = self.phi_z.forward(&z.posterior)?;

        let input_t = Tensor::cat(&[&z.x_features, &phi_z_t], D::Minus1)?;
        self.memory.forward_step(&input_t.contiguous()?, false)?;

        if produce_output {
            let dec_input_t = Tensor::cat(&[&phi_z_t, &state_mean], D::Minus1)?;
            Ok(Some(self.decoder.forward_t(&dec_input_t, train)?))
        } else {
            Ok(None)
        }
    }

    /// Single-step cycle: posterior, NaN checks, decode.
    pub fn step(&mut self, x_i: &Tensor, aux: &[Tensor], train: bool) -> Result<(Tensor, VrnnParams)> {
        let x_i_inference = if self.config.add_input_noise {
            add_quantization_noise(x_i)?
        } else {
            x_i.clone()
        };
        let (z_t, params_t) = self.posterior(&x_i_inference, aux, train)?;
        nan_check_and_break(&x_i_inference, "x_inference")?;
        nan_check_and_break(&z_t.prior, "prior")?;
        nan_check_and_break(&z_t.posterior, "posterior")?;
        nan_check_and_break(&z_t.x_features, "x_features")?;

        let decoded_t = match self.decode_step(&z_t, true, train)? {
            Some(d) => d,
            None => candle_core::bail!("decoder produced no output"),
        };
        nan_check_and_break(&decoded_t, "decoded_t")?;

        Ok((decoded_t, params_t))
    }

    /// Posterior of the activated reconstruction, folded into the step
    /// parameters when a mutual-information weight is configured.
    fn compute_mi_params(
        &mut self,
        decoded: &Tensor,
        mut params: VrnnParams,
        train: bool,
    ) -> Result<VrnnParams> {
        if self.config.mut_info_enabled() {
            let x_hat = nll_activation(decoded, self.config.nll)?;
            let (_z, recoded) = self.posterior(&x_hat, &[], train)?;
            params.q_z_given_xhat = Some(recoded.posterior);
        }
        Ok(params)
    }

    /// Lazy multi-step unroll of length `max_time_steps`: re-initializes
    /// the recurrent state at the first step and clears the snapshot buffer
    /// after the last. Restart by calling `rollout` again.
    pub fn rollout(&mut self, input: RolloutInput, train: bool) -> Rollout<'_> {
        let steps = self.config.max_time_steps;
        Rollout {
            model: self,
            input,
            feedback: None,
            step_idx: 0,
            steps,
            train,
            failed: false,
        }
    }

    /// Full unroll, collecting every decoded output and parameter record.
    pub fn forward_t(
        &mut self,
        input: RolloutInput,
        train: bool,
    ) -> Result<(Vec<Tensor>, Vec<VrnnParams>)> {
        let mut decoded = Vec::new();
        let mut params = Vec::new();
        for item in self.rollout(input, train) {
            let (decoded_t, params_t) = item?;
            decoded.push(decoded_t);
            params.push(params_t);
        }
        Ok((decoded, params))
    }

    /// Posterior-vs-prior KL, plus the prior's own divergence from the
    /// strategy's hyper-prior when configured.
    pub fn kld(&self, params: &VrnnParams) -> Result<Tensor> {
        let kl = self
            .reparameterizer
            .kl(&params.posterior, Some(&params.prior))?;
        if self.config.use_prior_kl {
            kl + self.reparameterizer.kl(&params.prior, None)?
        } else {
            Ok(kl)
        }
    }

    pub fn mut_info(&self, params: &VrnnParams, batch_size: usize) -> Result<Tensor> {
        let zeros = Tensor::zeros(batch_size, self.config.dtype, &self.config.device)?;
        if !self.config.mut_info_enabled() {
            return Ok(zeros);
        }
        match &params.q_z_given_xhat {
            None => Ok(zeros),
            Some(recoded) => {
                let raw = self.reparameterizer.mutual_info(&params.posterior, recoded)?;
                clamp_mut_info(self.config.mut_clamp, raw)
            }
        }
    }

    /// Per-step losses summed and divided by the step count.
    ///
    /// A single target consumed by several reconstructions is split
    /// proportionally: each pair is scaled by `1 / len` and every slot
    /// compares against the final reconstruction.
    pub fn loss_function(
        &self,
        recon_x: &[Tensor],
        x: &[Tensor],
        params: &[VrnnParams],
    ) -> Result<VaeLossTerms> {
        if recon_x.len() != params.len() {
            candle_core::bail!(
                "{} reconstructions vs {} parameter records",
                recon_x.len(),
                params.len()
            );
        }
        let (recon_x, x) = if x.len() == 1 && recon_x.len() > 1 {
            let scale = 1.0 / recon_x.len() as f64;
            let x_scaled = (&x[0] * scale)?;
            let last = match recon_x.last() {
                Some(r) => (r * scale)?,
                None => candle_core::bail!("empty reconstruction list"),
            };
            (
                vec![last; recon_x.len()],
                vec![x_scaled; recon_x.len()],
            )
        } else if recon_x.len() == x.len() {
            (recon_x.to_vec(), x.to_vec())
        } else {
            candle_core::bail!("{} reconstructions vs {} targets", recon_x.len(), x.len());
        };

        let mut step_terms = Vec::with_capacity(recon_x.len());
        for ((recon_t, x_t), params_t) in recon_x.iter().zip(x.iter()).zip(params.iter()) {
            let (recon_t, x_t) = if recon_t.rank() == 4 && x_t.rank() == 4 {
                ensure_same_size(recon_t, x_t)?
            } else {
                (recon_t.clone(), x_t.clone())
            };
            let kld = self.kld(params_t)?;
            let mut_info = self.mut_info(params_t, x_t.dim(0)?)?;
            let proxy = self.reparameterizer.proxy_loss()?;
            step_terms.push(elbo_loss_terms(
                self.config.nll,
                self.config.kl_beta,
                &recon_t,
                &x_t,
                &kld,
                &mut_info,
                proxy.as_ref(),
            )?);
        }
        VaeLossTerms::mean_of(&step_terms)
    }

    /// Reduce reconstruction logits to input width: variance-bearing
    /// families feed only the location half back into the next step.
    fn recon_to_input(&self, decoded: &Tensor) -> Result<Tensor> {
        if nll_has_variance(self.config.nll) {
            let width = decoded.dim(D::Minus1)?;
            decoded.narrow(D::Minus1, 0, width / 2)
        } else {
            Ok(decoded.clone())
        }
    }

    fn decode_generated(&self, dec_input_t: &Tensor) -> Result<Tensor> {
        let dec_logits_t = self.decoder.forward_t(dec_input_t, false)?;
        match &self.pixel_sampler {
            Some(sampler) => sampler.sample(&dec_logits_t),
            None => nll_activation(&dec_logits_t, self.config.nll),
        }
    }

    /// Draw a prior (or EMA-conditioned) latent, decode it once against the
    /// current memory trace, then unroll `max_time_steps - 1` further
    /// self-referential steps, accumulating every intermediate output.
    pub fn generate_synthetic_samples(
        &mut self,
        batch_size: usize,
        generate: &GenerateConfig,
    ) -> Result<Tensor> {
        if generate.reset_state || self.memory.get_state().is_err() {
            self.memory.init_state(batch_size, false)?;
        }
        let state_mean = self.memory.mean_state_hidden()?;

        let z_prior_t = if generate.use_aggregate_posterior {
            let ema_logits = match self.aggregate_posterior_prior.value() {
                Some(v) => v.clone(),
                None => candle_core::bail!("aggregate posterior has not been fed yet"),
            };
            self.reparameterizer.forward_t(&ema_logits, false)?.0
        } else {
            self.reparameterizer
                .prior(batch_size, self.config.generative_scale_var)?
        };

        let phi_z_t = self.phi_z.forward(&z_prior_t)?;
        let dec_input_t = Tensor::cat(&[&phi_z_t, &state_mean], D::Minus1)?;
        let mut dec_output_t = self.decode_generated(&dec_input_t)?;

        let mut decoded_list = vec![dec_output_t.clone()];
        for _ in 0..self.config.max_time_steps - 1 {
            let (dec_output_tp1, _params) = self.step(&dec_output_t, &[], false)?;
            dec_output_t = (dec_output_t + self.recon_to_input(&dec_output_tp1)?)?;
            decoded_list.push(dec_output_t.clone());
        }
        self.memory.clear();

        let refs = decoded_list.iter().collect::<Vec<_>>();
        Tensor::cat(&refs, 0)
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }
}

/// Finite, restartable unroll over `max_time_steps` steps.
///
/// Initializes the recurrent state on the first step; clears the memory
/// snapshot buffer once the last step has been produced (or on error), so a
/// completed iteration never leaves unbounded history behind.
pub struct Rollout<'a> {
    model: &'a mut Vrnn,
    input: RolloutInput,
    feedback: Option<Tensor>,
    step_idx: usize,
    steps: usize,
    train: bool,
    failed: bool,
}

impl Rollout<'_> {
    fn next_step(&mut self) -> Result<(Tensor, VrnnParams)> {
        if self.step_idx == 0 {
            let batch_size = match &self.input {
                RolloutInput::Single(x) => x.dim(0)?,
                RolloutInput::PerStep(xs) => match xs.first() {
                    Some(x) => x.dim(0)?,
                    None => candle_core::bail!("empty input sequence"),
                },
            };
            let noisy = self.train && self.model.config.use_noisy_rnn_state;
            self.model.memory.init_state(batch_size, noisy)?;
        }

        let (decoded_t, params_t) = match &self.input {
            RolloutInput::PerStep(xs) => {
                let x_i = match xs.get(self.step_idx) {
                    Some(x) => x.clone(),
                    None => candle_core::bail!(
                        "input sequence has {} steps, needed {}",
                        xs.len(),
                        self.steps
                    ),
                };
                self.model.step(&x_i, &[], self.train)?
            }
            RolloutInput::Single(x0) => {
                let x_i = match self.feedback.as_ref() {
                    Some(prev) => prev.clone(),
                    None => x0.clone(),
                };
                let (decoded_t, params_t) = self.model.step(&x_i, &[], self.train)?;
                // first step replaces the input, later ones accumulate
                let decoded_input = self.model.recon_to_input(&decoded_t)?;
                self.feedback = Some(if self.step_idx == 0 {
                    decoded_input
                } else {
                    (decoded_input + &x_i)?
                });
                (decoded_t, params_t)
            }
        };

        let params_t = self.model.compute_mi_params(&decoded_t, params_t, self.train)?;
        Ok((decoded_t, params_t))
    }
}

impl Iterator for Rollout<'_> {
    type Item = Result<(Tensor, VrnnParams)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.step_idx >= self.steps {
            return None;
        }
        let item = self.next_step();
        self.step_idx += 1;
        match item {
            Ok(out) => {
                if self.step_idx == self.steps {
                    self.model.memory.clear();
                }
                Some(Ok(out))
            }
            Err(e) => {
                self.failed = true;
                self.model.memory.clear();
                Some(Err(e))
            }
        }
    }
}
