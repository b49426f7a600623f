use candle_core::{Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder};

use crate::candle_aux_layers::{dense_stack, StackLayers};
use crate::candle_loss_functions::nll_has_variance;
use crate::candle_model_config::LikelihoodKind;
use crate::candle_model_traits::DecoderModuleT;

/// Dense reference decoder producing flat unactivated reconstruction logits.
///
/// When the likelihood family carries variance the output width doubles:
/// location features followed by log-scale features.
pub struct DenseDecoder {
    n_obs: usize,
    n_latent: usize,
    has_variance: bool,
    fc: StackLayers<Linear>,
}

impl DenseDecoder {
    /// Creates variables `nn.dec.fc.{}.weight` and `nn.dec.out.weight`.
    ///
    /// * `n_latent` - latent input width
    /// * `hidden` - fully connected layers, each with the dim
    /// * `output_shape` - data shape without the batch dim
    /// * `kind` - likelihood family, decides the variance head
    pub fn new(
        n_latent: usize,
        hidden: &[usize],
        output_shape: &[usize],
        kind: LikelihoodKind,
        activation: Activation,
        vs: VarBuilder,
    ) -> Result<Self> {
        let n_obs = output_shape.iter().product::<usize>();
        if n_obs == 0 {
            candle_core::bail!("empty decoder output shape");
        }
        let has_variance = nll_has_variance(kind);
        let out_dim = if has_variance { 2 * n_obs } else { n_obs };
        let fc = dense_stack(n_latent, hidden, out_dim, activation, None, vs.pp("nn.dec"))?;
        Ok(Self {
            n_obs,
            n_latent,
            has_variance,
            fc,
        })
    }

    pub fn has_variance(&self) -> bool {
        self.has_variance
    }
}

impl DecoderModuleT for DenseDecoder {
    fn forward_t(&self, z_nk: &Tensor, _train: bool) -> Result<Tensor> {
        if z_nk.dim(z_nk.rank() - 1)? != self.n_latent {
            candle_core::bail!(
                "decoder expected latent width {}, got {}",
                self.n_latent,
                z_nk.dim(z_nk.rank() - 1)?
            );
        }
        self.fc.forward(z_nk)
    }

    fn dim_obs(&self) -> usize {
        self.n_obs
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}
