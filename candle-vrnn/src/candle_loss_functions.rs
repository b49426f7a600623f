#![allow(dead_code)]

use core::f64;

use candle_core::{DType, Result, Tensor};
use candle_nn::ops;

use crate::candle_model_config::LikelihoodKind;

/// KL divergence loss between a Gaussian distribution and N(0, I)
///
/// 0.5 * (sigma^2 - 1 + mu^2 - log(sigma^2))
///
/// * `z_mean` - mean of Gaussian distribution
/// * `z_lnvar` - log variance of Gaussian distribution
///
pub fn gaussian_kl_loss(z_mean: &Tensor, z_lnvar: &Tensor) -> Result<Tensor> {
    let z_var = z_lnvar.exp()?;
    (z_var - 1. + z_mean.powf(2.)? - z_lnvar)?.sum(z_mean.rank() - 1)? * 0.5
}

/// KL divergence between two diagonal Gaussians
///
/// 0.5 * sum_k [ lnvar_b - lnvar_a + (var_a + (mu_a - mu_b)^2) / var_b - 1 ]
///
pub fn gaussian_kl_between(
    mu_a: &Tensor,
    lnvar_a: &Tensor,
    mu_b: &Tensor,
    lnvar_b: &Tensor,
) -> Result<Tensor> {
    let var_a = lnvar_a.exp()?;
    let var_b = lnvar_b.exp()?;
    let ratio = (var_a + mu_a.sub(mu_b)?.powf(2.)?)?.div(&var_b)?;
    let lnvar_diff = (lnvar_b - lnvar_a)?;
    ((lnvar_diff + ratio)? - 1.)?.sum(mu_a.rank() - 1)? * 0.5
}

/// KL divergence of a categorical against the uniform prior Cat(1/K)
///
/// sum_k exp(log_q(k)) * (log_q(k) - log(1/K))
///
/// * `log_q_z` - normalized log probabilities (n x K)
///
pub fn categorical_kl_uniform(log_q_z: &Tensor) -> Result<Tensor> {
    let k = log_q_z.dim(log_q_z.rank() - 1)? as f64;
    let log_p_z = (1.0 / k).ln();
    (log_q_z.exp()? * (log_q_z - log_p_z)?)?.sum(log_q_z.rank() - 1)
}

/// Exact KL divergence between two categoricals given normalized log probs
pub fn categorical_kl_between(log_q_a: &Tensor, log_q_b: &Tensor) -> Result<Tensor> {
    (log_q_a.exp()? * log_q_a.sub(log_q_b)?)?.sum(log_q_a.rank() - 1)
}

/// Entropy of the categorical parameterized by unactivated `logits`
pub fn categorical_entropy(logits: &Tensor) -> Result<Tensor> {
    let last = logits.rank() - 1;
    let log_p = ops::log_softmax(logits, last)?;
    (log_p.exp()? * &log_p)?.sum(last)?.neg()
}

/// True when the likelihood family carries a log-scale head, doubling the
/// decoder's output width.
pub fn nll_has_variance(kind: LikelihoodKind) -> bool {
    matches!(kind, LikelihoodKind::Gaussian | LikelihoodKind::Laplace)
}

fn flatten_batch(x: &Tensor) -> Result<Tensor> {
    if x.rank() == 1 {
        candle_core::bail!("expected a batched tensor, got rank-1");
    }
    if x.rank() == 2 {
        Ok(x.clone())
    } else {
        x.flatten_from(1)
    }
}

fn split_location_scale(recon_n2d: &Tensor, dim_obs: usize) -> Result<(Tensor, Tensor)> {
    let width = recon_n2d.dim(1)?;
    if width != 2 * dim_obs {
        candle_core::bail!(
            "variance-bearing reconstruction must be twice the data width: {} vs {}",
            width,
            dim_obs
        );
    }
    let loc = recon_n2d.narrow(1, 0, dim_obs)?;
    let log_scale = recon_n2d.narrow(1, dim_obs, dim_obs)?;
    Ok((loc, log_scale))
}

/// Reconstruction negative log-likelihood, reduced to a batch-size vector.
///
/// * `x` - observed data, any shape with a leading batch dim
/// * `recon_logits` - unactivated reconstruction logits
/// * `kind` - likelihood family
///
pub fn nll(x: &Tensor, recon_logits: &Tensor, kind: LikelihoodKind) -> Result<Tensor> {
    let x_nd = flatten_batch(x)?;
    let recon = flatten_batch(recon_logits)?;
    let dim_obs = x_nd.dim(1)?;

    match kind {
        LikelihoodKind::Bernoulli => {
            // stable binary cross-entropy with logits:
            // max(l, 0) - l*x + log(1 + exp(-|l|))
            let l = recon;
            let max_part = l.maximum(0.0)?;
            let softplus = (l.abs()?.neg()?.exp()? + 1.0)?.log()?;
            ((max_part - l.mul(&x_nd)?)? + softplus)?.sum(1)
        }
        LikelihoodKind::Gaussian => {
            let (mu, lnvar) = split_location_scale(&recon, dim_obs)?;
            let sq = x_nd.sub(&mu)?.powf(2.)?.div(&lnvar.exp()?)?;
            ((sq + &lnvar)? + (2.0 * f64::consts::PI).ln())?.sum(1)? * 0.5
        }
        LikelihoodKind::Laplace => {
            let (mu, log_b) = split_location_scale(&recon, dim_obs)?;
            let abs_term = x_nd.sub(&mu)?.abs()?.div(&log_b.exp()?)?;
            ((abs_term + &log_b)? + f64::consts::LN_2)?.sum(1)
        }
    }
}

/// Map unactivated reconstruction logits back to data space.
///
/// Variance-bearing families return the location half unchanged.
pub fn nll_activation(recon_logits: &Tensor, kind: LikelihoodKind) -> Result<Tensor> {
    match kind {
        LikelihoodKind::Bernoulli => ops::sigmoid(recon_logits),
        LikelihoodKind::Gaussian | LikelihoodKind::Laplace => {
            let recon = flatten_batch(recon_logits)?;
            let width = recon.dim(1)?;
            if width % 2 != 0 {
                candle_core::bail!("variance-bearing logits must have even width");
            }
            recon.narrow(1, 0, width / 2)
        }
    }
}

/// Halt on NaN/Inf: a non-finite value in a monitored tensor signals
/// upstream training instability and is not recoverable.
pub fn nan_check_and_break(x: &Tensor, label: &str) -> Result<()> {
    let total = x.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;
    if !total.is_finite() {
        candle_core::bail!("non-finite values detected in {}", label);
    }
    Ok(())
}
