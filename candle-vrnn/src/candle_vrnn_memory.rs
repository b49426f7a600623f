use std::sync::Arc;

use candle_core::{Result, Tensor};
use candle_nn::rnn::LSTMState;
use candle_nn::{lstm, LSTMConfig, RNN, VarBuilder};

use crate::candle_model_config::ModelConfig;

/// Recurrent memory for the sequential model.
///
/// Wraps a stack of LSTM layers, holds the current (hidden, cell) state per
/// layer, and archives a cloned `(output, state)` snapshot on every step so
/// merged/final views of the trace stay available. The snapshot buffer must
/// be cleared at sequence boundaries to bound its growth.
pub struct VrnnMemory {
    config: Arc<ModelConfig>,
    h_dim: usize,
    n_layers: usize,
    layers: Vec<candle_nn::LSTM>,
    state: Option<Vec<LSTMState>>,
    output: Option<Tensor>,
    memory_buffer: Vec<(Tensor, Vec<LSTMState>)>,
}

impl VrnnMemory {
    /// Eagerly builds all LSTM layers; creates variables under
    /// `rnn.{layer}` in the given builder.
    pub fn new(
        input_size: usize,
        h_dim: usize,
        n_layers: usize,
        config: Arc<ModelConfig>,
        vs: VarBuilder,
    ) -> Result<Self> {
        if n_layers == 0 {
            candle_core::bail!("recurrent memory needs at least one layer");
        }
        let mut layers = Vec::with_capacity(n_layers);
        for i in 0..n_layers {
            let in_dim = if i == 0 { input_size } else { h_dim };
            layers.push(lstm(
                in_dim,
                h_dim,
                LSTMConfig::default(),
                vs.pp(format!("rnn.{}", i)),
            )?);
        }
        Ok(Self {
            config,
            h_dim,
            n_layers,
            layers,
            state: None,
            output: None,
            memory_buffer: Vec::new(),
        })
    }

    /// Replace the state wholesale with zeros, or with small-variance
    /// Gaussian noise when `noisy` is set.
    pub fn init_state(&mut self, batch_size: usize, noisy: bool) -> Result<()> {
        let mut state = Vec::with_capacity(self.n_layers);
        for _ in 0..self.n_layers {
            let h = self.init_tensor(batch_size, noisy)?;
            let c = self.init_tensor(batch_size, noisy)?;
            state.push(LSTMState { h, c });
        }
        self.state = Some(state);
        Ok(())
    }

    fn init_tensor(&self, batch_size: usize, noisy: bool) -> Result<Tensor> {
        let shape = (batch_size, self.h_dim);
        let t = if noisy {
            Tensor::randn(0f32, 0.01f32, shape, &self.config.device)?
        } else {
            Tensor::zeros(shape, candle_core::DType::F32, &self.config.device)?
        };
        t.to_dtype(self.config.dtype)
    }

    /// Single-step forward pass: runs every layer on the current state,
    /// archives a snapshot and updates the current output/state.
    pub fn forward_step(&mut self, input_t: &Tensor, reset_state: bool) -> Result<Tensor> {
        if reset_state {
            self.init_state(input_t.dim(0)?, false)?;
        }
        let state = match self.state.as_ref() {
            Some(s) => s,
            None => candle_core::bail!("initialize the recurrent state first"),
        };

        let mut x = input_t.contiguous()?;
        let mut next_state = Vec::with_capacity(self.n_layers);
        for (layer, layer_state) in self.layers.iter().zip(state.iter()) {
            let s = layer.step(&x, layer_state)?;
            x = s.h.clone();
            next_state.push(s);
        }

        self.memory_buffer.push((x.clone(), next_state.clone()));
        self.output = Some(x.clone());
        self.state = Some(next_state);
        Ok(x)
    }

    /// Empties the snapshot buffer; call at sequence boundaries.
    pub fn clear(&mut self) {
        self.memory_buffer.clear();
    }

    pub fn buffer_len(&self) -> usize {
        self.memory_buffer.len()
    }

    pub fn get_state(&self) -> Result<&[LSTMState]> {
        match self.state.as_deref() {
            Some(s) => Ok(s),
            None => candle_core::bail!("do a forward pass first"),
        }
    }

    pub fn get_output(&self) -> Result<&Tensor> {
        match self.output.as_ref() {
            Some(o) => Ok(o),
            None => candle_core::bail!("do a forward pass first"),
        }
    }

    /// Mean over layers of the current hidden state: `[batch, h_dim]`.
    pub fn mean_state_hidden(&self) -> Result<Tensor> {
        let state = self.get_state()?;
        let hs = state.iter().map(|s| &s.h).collect::<Vec<_>>();
        Tensor::stack(&hs, 0)?.mean(0)
    }

    /// Mean over every archived step and layer of the hidden states.
    pub fn get_merged_memory(&self) -> Result<Tensor> {
        if self.memory_buffer.is_empty() {
            candle_core::bail!("do a forward pass first");
        }
        let mut hs = Vec::new();
        for (_output, state) in self.memory_buffer.iter() {
            for s in state.iter() {
                hs.push(&s.h);
            }
        }
        Tensor::stack(&hs, 0)?.mean(0)
    }

    /// Hidden states of the last archived step: `[layers, batch, h_dim]`.
    pub fn get_final_memory(&self) -> Result<Tensor> {
        match self.memory_buffer.last() {
            Some((_output, state)) => {
                let hs = state.iter().map(|s| &s.h).collect::<Vec<_>>();
                Tensor::stack(&hs, 0)
            }
            None => candle_core::bail!("do a forward pass first"),
        }
    }

    /// Detach every tensor of the current state from its gradient history;
    /// used to truncate backpropagation through time.
    pub fn get_repackaged_state(&self) -> Result<Vec<LSTMState>> {
        let state = self.get_state()?;
        Ok(state
            .iter()
            .map(|s| LSTMState {
                h: s.h.detach(),
                c: s.c.detach(),
            })
            .collect())
    }
}
