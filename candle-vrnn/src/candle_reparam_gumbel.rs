use std::sync::Arc;

use candle_core::{DType, Result, Tensor, D};
use candle_nn::ops;

use crate::candle_aux_module::dtype_eps;
use crate::candle_loss_functions::{
    categorical_entropy, categorical_kl_between, categorical_kl_uniform,
};
use crate::candle_model_config::ModelConfig;
use crate::candle_model_traits::{DiscreteParams, LatentParams, Reparameterize};

/// Gumbel-softmax reparameterization of a categorical distribution.
///
/// Training exposes the soft relaxation, evaluation the hard one-hot; the
/// gradient always routes through the soft path (straight-through).
pub struct GumbelSoftmax {
    config: Arc<ModelConfig>,
    tau: f64,
    tau0: f64,
    anneal_rate: f64,
    min_temp: f64,
    iteration: usize,
}

impl GumbelSoftmax {
    pub fn new(config: Arc<ModelConfig>) -> Result<Self> {
        if config.discrete_size == 0 {
            candle_core::bail!("discrete_size must be positive");
        }
        Ok(Self {
            config,
            tau: 1.0,
            tau0: 1.0,
            anneal_rate: 3e-6,
            min_temp: 0.5,
            iteration: 0,
        })
    }

    /// Override the default anneal schedule (tau0 = 1.0, rate = 3e-6,
    /// floor = 0.5).
    pub fn with_schedule(
        config: Arc<ModelConfig>,
        tau0: f64,
        anneal_rate: f64,
        min_temp: f64,
    ) -> Result<Self> {
        let mut gumbel = Self::new(config)?;
        gumbel.tau = tau0;
        gumbel.tau0 = tau0;
        gumbel.anneal_rate = anneal_rate;
        gumbel.min_temp = min_temp;
        Ok(gumbel)
    }

    pub fn temperature(&self) -> f64 {
        self.tau
    }

    /// Smooth exponential anneal, floored at `min_temp`. Only fires in
    /// training mode on positive multiples of the configured interval.
    fn anneal(&mut self, train: bool) {
        let interval = self.config.anneal_interval;
        if train && self.iteration > 0 && self.iteration % interval == 0 {
            let rate = -self.anneal_rate * self.iteration as f64;
            self.tau = (self.tau0 * rate.exp()).max(self.min_temp);
        }
    }

    /// Gumbel noise: -ln(-ln(u + eps) + eps) for u ~ U(0, 1)
    fn gumbel_noise(x: &Tensor) -> Result<Tensor> {
        let eps = dtype_eps(x.dtype());
        let u = x.rand_like(0.0, 1.0)?;
        ((u + eps)?.log()?.neg()? + eps)?.log()?.neg()
    }

    /// Relaxed sample: softmax((logits + gumbel) / tau)
    fn sample_soft(&self, logits: &Tensor) -> Result<Tensor> {
        let noise = Self::gumbel_noise(logits)?;
        let scaled = ((logits + noise)? / self.tau)?;
        ops::softmax(&scaled, D::Minus1)
    }

    /// Straight-through hard sample: the forward value is the one-hot argmax
    /// of `soft`, the gradient is the identity on `soft`.
    fn sample_hard(soft: &Tensor) -> Result<Tensor> {
        let k = soft.dim(D::Minus1)?;
        let idx = soft.argmax(D::Minus1)?.to_dtype(DType::I64)?;
        let one_hot = candle_nn::encoding::one_hot(idx, k, 1f32, 0f32)?.to_dtype(soft.dtype())?;
        (one_hot - soft)?.detach() + soft
    }
}

impl Reparameterize for GumbelSoftmax {
    fn input_size(&self) -> usize {
        self.config.discrete_size
    }

    fn output_size(&self) -> usize {
        self.config.discrete_size
    }

    fn forward_t(&mut self, logits: &Tensor, train: bool) -> Result<(Tensor, LatentParams)> {
        self.anneal(train); // anneal first
        let log_q_z = ops::log_softmax(logits, D::Minus1)?;
        let z_soft = self.sample_soft(logits)?;
        let z_hard = Self::sample_hard(&z_soft)?;
        self.iteration += 1;

        let z = if train { z_soft.clone() } else { z_hard.clone() };
        let params = DiscreteParams {
            logits: logits.clone(),
            log_q_z,
            z_soft,
            z_hard,
            tau: self.tau,
        };
        Ok((z, LatentParams::Discrete(params)))
    }

    /// Uniform categorical prior returned as one-hot float rows.
    fn prior(&self, batch_size: usize, _scale_var: f64) -> Result<Tensor> {
        let k = self.config.discrete_size;
        let idx = Tensor::rand(0f32, k as f32, batch_size, &self.config.device)?
            .floor()?
            .clamp(0f64, (k - 1) as f64)?
            .to_dtype(DType::I64)?;
        candle_nn::encoding::one_hot(idx, k, 1f32, 0f32)?.to_dtype(self.config.dtype)
    }

    fn kl(&self, dist_a: &LatentParams, prior: Option<&LatentParams>) -> Result<Tensor> {
        let a = dist_a.discrete()?;
        match prior {
            None => categorical_kl_uniform(&a.log_q_z),
            Some(p) => categorical_kl_between(&a.log_q_z, &p.discrete()?.log_q_z),
        }
    }

    /// I(z; x) ~ H(z_hard) cross-entropy against the re-encoded posterior,
    /// plus the negative entropy of the hard categorical (analytic form).
    fn mutual_info(&self, posterior: &LatentParams, recoded: &LatentParams) -> Result<Tensor> {
        let weight = self.config.discrete_mut_info;
        let q = posterior.discrete()?;
        if weight == 0.0 {
            let batch_size = q.logits.dim(0)?;
            return Tensor::zeros(batch_size, q.logits.dtype(), q.logits.device());
        }
        let q_hat = recoded.discrete()?;

        let targets = q.z_hard.argmax_keepdim(D::Minus1)?;
        let log_q_hat = ops::log_softmax(&q_hat.logits, D::Minus1)?;
        let crossent_loss = log_q_hat
            .gather(&targets, D::Minus1)?
            .squeeze(D::Minus1)?;
        let ent_loss = categorical_entropy(&q.z_hard)?.neg()?;
        (ent_loss + crossent_loss)? * weight
    }

    fn log_likelihood(&self, z: &Tensor, params: &LatentParams) -> Result<Tensor> {
        let p = params.discrete()?;
        let log_q = ops::log_softmax(&p.logits, D::Minus1)?;
        let idx = z.to_dtype(DType::U32)?.unsqueeze(D::Minus1)?;
        log_q.gather(&idx, D::Minus1)?.squeeze(D::Minus1)
    }

    fn scalars(&self) -> Vec<(&'static str, f64)> {
        vec![("tau_scalar", self.tau)]
    }
}

impl GumbelSoftmax {
    /// Single-sample Monte-Carlo estimate of the mutual information, using a
    /// freshly drawn prior sample instead of the analytic entropy.
    pub fn mutual_info_monte_carlo(&self, recoded: &LatentParams) -> Result<Tensor> {
        let q_hat = recoded.discrete()?;
        let eps = dtype_eps(q_hat.logits.dtype());
        let log_q = (&q_hat.logits + eps)?;
        let p_z = self.prior(log_q.dim(0)?, 1.0)?;
        let crossent_loss = log_q.mul(&p_z)?.sum(D::Minus1)?.neg()?;
        let ent_loss = (p_z.clone() + eps)?.log()?.mul(&p_z)?.sum(D::Minus1)?.neg()?;
        ent_loss + crossent_loss
    }
}
