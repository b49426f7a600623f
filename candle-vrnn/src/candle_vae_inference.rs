use candle_core::Tensor;
use candle_nn::{AdamW, Optimizer};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;

use crate::candle_model_traits::{DecoderModuleT, EncoderModuleT};
use crate::candle_model_vae::Vae;
use crate::candle_model_vrnn::{RolloutInput, Vrnn};

pub struct TrainConfig {
    pub learning_rate: f32,
    pub num_epochs: usize,
    pub show_progress: bool,
    pub verbose: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            num_epochs: 100,
            show_progress: true,
            verbose: false,
        }
    }
}

/// Train a VAE over pre-batched minibatches.
///
/// Data loading stays with the caller; each tensor is one minibatch of
/// observations. Returns the per-epoch mean loss trace.
pub fn train_vae<Enc, Dec>(
    model: &mut Vae<Enc, Dec>,
    variable_map: &candle_nn::VarMap,
    minibatches: &[Tensor],
    train_config: &TrainConfig,
) -> anyhow::Result<Vec<f32>>
where
    Enc: EncoderModuleT,
    Dec: DecoderModuleT,
{
    if minibatches.is_empty() {
        anyhow::bail!("no minibatches supplied");
    }
    let mut adam = AdamW::new_lr(
        variable_map.all_vars(),
        train_config.learning_rate.into(),
    )?;

    let pb = ProgressBar::new(train_config.num_epochs as u64);
    if !train_config.show_progress || train_config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut loss_trace = vec![];

    for _epoch in 0..train_config.num_epochs {
        let mut loss_tot = 0f32;
        for x in minibatches.iter() {
            let (recon, params) = model.forward_t(x, true)?;
            let terms = model.loss_function(&recon, x, &params)?;
            adam.backward_step(&terms.loss_mean)?;
            loss_tot += terms.loss_mean.to_scalar::<f32>()?;
        }
        loss_trace.push(loss_tot / minibatches.len() as f32);
        pb.inc(1);

        if train_config.verbose {
            info!(
                "[{}] loss: {}",
                _epoch + 1,
                loss_trace.last().ok_or(anyhow::anyhow!("loss"))?
            );
        }
    } // each epoch

    pb.finish_and_clear();
    Ok(loss_trace)
}

/// Train a VRNN over pre-batched sequences, one tensor per time step.
pub fn train_vrnn(
    model: &mut Vrnn,
    variable_map: &candle_nn::VarMap,
    sequences: &[Vec<Tensor>],
    train_config: &TrainConfig,
) -> anyhow::Result<Vec<f32>> {
    if sequences.is_empty() {
        anyhow::bail!("no sequences supplied");
    }
    let mut adam = AdamW::new_lr(
        variable_map.all_vars(),
        train_config.learning_rate.into(),
    )?;

    let pb = ProgressBar::new(train_config.num_epochs as u64);
    if !train_config.show_progress || train_config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut loss_trace = vec![];

    for _epoch in 0..train_config.num_epochs {
        let mut loss_tot = 0f32;
        for seq in sequences.iter() {
            let (recons, params) =
                model.forward_t(RolloutInput::PerStep(seq.clone()), true)?;
            let terms = model.loss_function(&recons, seq, &params)?;
            adam.backward_step(&terms.loss_mean)?;
            loss_tot += terms.loss_mean.to_scalar::<f32>()?;
        }
        loss_trace.push(loss_tot / sequences.len() as f32);
        pb.inc(1);

        if train_config.verbose {
            info!(
                "[{}] loss: {}",
                _epoch + 1,
                loss_trace.last().ok_or(anyhow::anyhow!("loss"))?
            );
        }
    } // each epoch

    pb.finish_and_clear();
    Ok(loss_trace)
}
