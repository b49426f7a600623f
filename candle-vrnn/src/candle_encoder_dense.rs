use candle_core::{Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder};

use crate::candle_aux_layers::{dense_stack, StackLayers};
use crate::candle_model_traits::EncoderModuleT;

/// Dense reference encoder: flattens the observation and projects it through
/// a fully connected stack to unactivated latent logits.
///
/// Convolutional and autoregressive encoders implement the same trait
/// outside this crate.
pub struct DenseEncoder {
    n_obs: usize,
    n_latent: usize,
    fc: StackLayers<Linear>,
}

impl DenseEncoder {
    /// Creates variables `nn.enc.fc.{}.weight` and `nn.enc.out.weight`.
    pub fn new(
        n_obs: usize,
        hidden: &[usize],
        n_latent: usize,
        activation: Activation,
        vs: VarBuilder,
    ) -> Result<Self> {
        let fc = dense_stack(n_obs, hidden, n_latent, activation, None, vs.pp("nn.enc"))?;
        Ok(Self {
            n_obs,
            n_latent,
            fc,
        })
    }
}

impl EncoderModuleT for DenseEncoder {
    fn forward_t(&self, x_nd: &Tensor, _train: bool) -> Result<Tensor> {
        let x_nd = if x_nd.rank() > 2 {
            x_nd.flatten_from(1)?
        } else {
            x_nd.clone()
        };
        if x_nd.dim(1)? != self.n_obs {
            candle_core::bail!(
                "encoder expected {} features, got {}",
                self.n_obs,
                x_nd.dim(1)?
            );
        }
        self.fc.forward(&x_nd)
    }

    fn dim_obs(&self) -> usize {
        self.n_obs
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}
