use std::sync::Arc;

use approx::assert_relative_eq;
use candle_core::{DType, Device, Result, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};

use candle_vrnn::candle_loss_functions::{categorical_kl_uniform, gaussian_kl_loss};
use candle_vrnn::candle_model_config::{ModelConfig, ReparamKind};
use candle_vrnn::candle_model_traits::{LatentParams, Reparameterize};
use candle_vrnn::candle_reparam_gaussian::IsotropicGaussian;
use candle_vrnn::candle_reparam_gumbel::GumbelSoftmax;

fn gaussian_config(continuous_size: usize) -> Result<Arc<ModelConfig>> {
    ModelConfig {
        reparam: ReparamKind::IsotropicGaussian,
        continuous_size,
        ..Default::default()
    }
    .validated()
}

fn discrete_config(discrete_size: usize) -> Result<Arc<ModelConfig>> {
    ModelConfig {
        reparam: ReparamKind::Discrete,
        discrete_size,
        ..Default::default()
    }
    .validated()
}

#[test]
fn gaussian_kl_is_non_negative_for_random_parameters() -> Result<()> {
    let dev = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..20 {
        let mu: Vec<f32> = (0..3 * 5).map(|_| rng.random_range(-2.0..2.0)).collect();
        let lnvar: Vec<f32> = (0..3 * 5).map(|_| rng.random_range(-2.0..2.0)).collect();
        let mu = Tensor::from_vec(mu, (3, 5), &dev)?;
        let lnvar = Tensor::from_vec(lnvar, (3, 5), &dev)?;
        for v in gaussian_kl_loss(&mu, &lnvar)?.to_vec1::<f32>()? {
            assert!(v >= -1e-6, "kl must be non-negative, got {}", v);
        }
    }

    // zero exactly at the standard normal
    let mu = Tensor::zeros((2, 5), DType::F32, &dev)?;
    let lnvar = Tensor::zeros((2, 5), DType::F32, &dev)?;
    for v in gaussian_kl_loss(&mu, &lnvar)?.to_vec1::<f32>()? {
        assert_relative_eq!(v, 0.0, epsilon = 1e-6);
    }
    Ok(())
}

#[test]
fn gaussian_eval_mode_is_deterministic() -> Result<()> {
    let dev = Device::Cpu;
    let mut reparam = IsotropicGaussian::new(gaussian_config(8)?)?;
    let logits = Tensor::randn(0f32, 1f32, (3, 8), &dev)?;

    let (z_a, params_a) = reparam.forward_t(&logits, false)?;
    let (z_b, _) = reparam.forward_t(&logits, false)?;

    assert_eq!(z_a.to_vec2::<f32>()?, z_b.to_vec2::<f32>()?);
    let mu = match &params_a {
        LatentParams::Gaussian(p) => p.mu.to_vec2::<f32>()?,
        _ => panic!("expected gaussian parameters"),
    };
    assert_eq!(z_a.to_vec2::<f32>()?, mu);
    Ok(())
}

#[test]
fn gaussian_training_samples_differ_between_calls() -> Result<()> {
    let dev = Device::Cpu;
    let mut reparam = IsotropicGaussian::new(gaussian_config(8)?)?;
    let logits = Tensor::randn(0f32, 1f32, (3, 8), &dev)?;

    let (z_a, _) = reparam.forward_t(&logits, true)?;
    let (z_b, _) = reparam.forward_t(&logits, true)?;
    assert_ne!(z_a.to_vec2::<f32>()?, z_b.to_vec2::<f32>()?);
    Ok(())
}

#[test]
fn gaussian_two_distribution_kl_vanishes_on_identical_records() -> Result<()> {
    let dev = Device::Cpu;
    let mut reparam = IsotropicGaussian::new(gaussian_config(8)?)?;
    let logits = Tensor::randn(0f32, 1f32, (4, 8), &dev)?;
    let (_z, params) = reparam.forward_t(&logits, false)?;

    let kl = reparam.kl(&params, Some(&params))?;
    for v in kl.to_vec1::<f32>()? {
        assert_relative_eq!(v, 0.0, epsilon = 1e-5);
    }
    Ok(())
}

#[test]
fn gumbel_straight_through_hard_sample_is_one_hot() -> Result<()> {
    let dev = Device::Cpu;
    let mut reparam = GumbelSoftmax::new(discrete_config(10)?)?;
    let logits = Tensor::randn(0f32, 2f32, (6, 10), &dev)?;

    let (_z, params) = reparam.forward_t(&logits, true)?;
    let (soft, hard) = match &params {
        LatentParams::Discrete(p) => (p.z_soft.to_vec2::<f32>()?, p.z_hard.to_vec2::<f32>()?),
        _ => panic!("expected discrete parameters"),
    };

    for (soft_row, hard_row) in soft.iter().zip(hard.iter()) {
        let ones = hard_row.iter().filter(|&&v| (v - 1.0).abs() < 1e-6).count();
        let zeros = hard_row.iter().filter(|&&v| v.abs() < 1e-6).count();
        assert_eq!((ones, zeros), (1, hard_row.len() - 1));

        // the hard sample must sit on the argmax of the soft relaxation
        let argmax_soft = soft_row
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert!((hard_row[argmax_soft] - 1.0).abs() < 1e-6);
    }
    Ok(())
}

#[test]
fn gumbel_annealing_is_monotone_and_interval_gated() -> Result<()> {
    let dev = Device::Cpu;
    let mut reparam = GumbelSoftmax::new(discrete_config(4)?)?;
    let logits = Tensor::zeros((1, 4), DType::F32, &dev)?;

    let mut prev = reparam.temperature();
    assert_relative_eq!(prev, 1.0);
    for _ in 0..101 {
        reparam.forward_t(&logits, true)?;
        let tau = reparam.temperature();
        assert!(tau <= prev + 1e-12);
        assert!(tau >= 0.5);
        prev = tau;
    }
    // last anneal event fired at step 100
    assert_relative_eq!(prev, (-3e-6f64 * 100.0).exp(), epsilon = 1e-12);
    Ok(())
}

#[test]
fn gumbel_annealing_floors_at_min_temp() -> Result<()> {
    let dev = Device::Cpu;
    let mut reparam = GumbelSoftmax::with_schedule(discrete_config(4)?, 1.0, 0.1, 0.5)?;
    let logits = Tensor::zeros((1, 4), DType::F32, &dev)?;

    for _ in 0..101 {
        reparam.forward_t(&logits, true)?;
    }
    // exp(-0.1 * 100) is far below the floor
    assert_relative_eq!(reparam.temperature(), 0.5);
    Ok(())
}

#[test]
fn gumbel_eval_mode_never_anneals() -> Result<()> {
    let dev = Device::Cpu;
    let mut reparam = GumbelSoftmax::with_schedule(discrete_config(4)?, 1.0, 0.5, 0.01)?;
    let logits = Tensor::zeros((1, 4), DType::F32, &dev)?;
    for _ in 0..50 {
        reparam.forward_t(&logits, false)?;
    }
    assert_relative_eq!(reparam.temperature(), 1.0);
    Ok(())
}

#[test]
fn gumbel_soft_samples_lie_on_the_simplex() -> Result<()> {
    let dev = Device::Cpu;
    let mut reparam = GumbelSoftmax::new(discrete_config(10)?)?;
    let logits = Tensor::zeros((4, 10), DType::F32, &dev)?;

    let (z, params) = reparam.forward_t(&logits, true)?;
    for row in z.to_vec2::<f32>()? {
        let total: f32 = row.iter().sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-5);
        assert!(row.iter().all(|&v| v >= 0.0));
    }

    let hard = match &params {
        LatentParams::Discrete(p) => p.z_hard.to_vec2::<f32>()?,
        _ => panic!("expected discrete parameters"),
    };
    for row in hard {
        let ones = row.iter().filter(|&&v| (v - 1.0).abs() < 1e-6).count();
        assert_eq!(ones, 1);
    }
    Ok(())
}

#[test]
fn uniform_posterior_has_zero_kl_against_uniform_prior() -> Result<()> {
    let dev = Device::Cpu;
    // log_softmax of constant logits is exactly the uniform distribution
    let log_q_z = candle_nn::ops::log_softmax(&Tensor::zeros((4, 10), DType::F32, &dev)?, 1)?;
    for v in categorical_kl_uniform(&log_q_z)?.to_vec1::<f32>()? {
        assert_relative_eq!(v, 0.0, epsilon = 1e-6);
    }
    Ok(())
}

#[test]
fn gumbel_kl_between_identical_records_vanishes() -> Result<()> {
    let dev = Device::Cpu;
    let mut reparam = GumbelSoftmax::new(discrete_config(6)?)?;
    let logits = Tensor::randn(0f32, 1f32, (3, 6), &dev)?;
    let (_z, params) = reparam.forward_t(&logits, false)?;

    let kl = reparam.kl(&params, Some(&params))?;
    for v in kl.to_vec1::<f32>()? {
        assert_relative_eq!(v, 0.0, epsilon = 1e-6);
    }
    Ok(())
}

#[test]
fn log_likelihood_peaks_at_the_mean() -> Result<()> {
    let dev = Device::Cpu;
    let mut reparam = IsotropicGaussian::new(gaussian_config(8)?)?;
    let logits = Tensor::randn(0f32, 1f32, (3, 8), &dev)?;
    let (z_mu, params) = reparam.forward_t(&logits, false)?;

    let ll_at_mu = reparam.log_likelihood(&z_mu, &params)?;
    let shifted = (&z_mu + 1.0)?;
    let ll_shifted = reparam.log_likelihood(&shifted, &params)?;

    let at_mu = ll_at_mu.sum_all()?.to_scalar::<f32>()?;
    let away = ll_shifted.sum_all()?.to_scalar::<f32>()?;
    assert!(at_mu > away);
    Ok(())
}

#[test]
fn categorical_log_likelihood_scores_the_selected_class() -> Result<()> {
    let dev = Device::Cpu;
    let mut reparam = GumbelSoftmax::new(discrete_config(4)?)?;
    let logits = Tensor::new(&[[0f32, 0., 0., 10.], [10., 0., 0., 0.]], &dev)?;
    let (_z, params) = reparam.forward_t(&logits, false)?;

    let idx = Tensor::new(&[3u32, 0u32], &dev)?;
    let ll = reparam.log_likelihood(&idx, &params)?;
    for v in ll.to_vec1::<f32>()? {
        // the dominant class holds almost all of the probability mass
        assert!(v > -1e-3);
    }
    Ok(())
}

#[test]
fn mismatched_parameter_record_is_rejected() -> Result<()> {
    let dev = Device::Cpu;
    let mut gauss = IsotropicGaussian::new(gaussian_config(8)?)?;
    let mut gumbel = GumbelSoftmax::new(discrete_config(4)?)?;

    let (_z, gauss_params) = gauss.forward_t(&Tensor::zeros((2, 8), DType::F32, &dev)?, false)?;
    let (_z, gumbel_params) = gumbel.forward_t(&Tensor::zeros((2, 4), DType::F32, &dev)?, false)?;

    assert!(gauss.kl(&gumbel_params, None).is_err());
    assert!(gumbel.kl(&gauss_params, None).is_err());
    Ok(())
}
