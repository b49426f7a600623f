pub mod candle_aux_layers;
pub mod candle_aux_module;
pub mod candle_decoder_dense;
pub mod candle_encoder_dense;
pub mod candle_loss_functions;
pub mod candle_model_config;
pub mod candle_model_traits;
pub mod candle_model_vae;
pub mod candle_model_vrnn;
pub mod candle_reparam;
pub mod candle_reparam_gaussian;
pub mod candle_reparam_gumbel;
pub mod candle_vae_inference;
pub mod candle_vrnn_memory;

pub use candle_core;
pub use candle_nn;
