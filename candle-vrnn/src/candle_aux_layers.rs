#![allow(dead_code)]

use candle_core::{Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder};

/// build a stack of alternating `M` and `A` layers
pub struct StackLayers<M>
where
    M: Module,
{
    module_layers: Vec<M>,
    activation_layers: Vec<Option<Activation>>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
        }
    }

    /// Appends a layer followed by an activation.
    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
    }

    pub fn is_empty(&self) -> bool {
        self.module_layers.is_empty()
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Build a dense projection: `in_dim -> hidden... -> out_dim` with the given
/// activation between layers and an optional activation on the head.
///
/// Creates variables `fc.{}.weight` per hidden layer and `out.weight`.
pub fn dense_stack(
    in_dim: usize,
    hidden: &[usize],
    out_dim: usize,
    activation: Activation,
    head_activation: Option<Activation>,
    vs: VarBuilder,
) -> Result<StackLayers<Linear>> {
    let mut fc = StackLayers::<Linear>::new();
    let mut prev_dim = in_dim;
    for (j, &next_dim) in hidden.iter().enumerate() {
        let _name = format!("fc.{}", j);
        fc.push_with_act(candle_nn::linear(prev_dim, next_dim, vs.pp(_name))?, activation);
        prev_dim = next_dim;
    }

    let head = candle_nn::linear(prev_dim, out_dim, vs.pp("out"))?;
    match head_activation {
        Some(act) => fc.push_with_act(head, act),
        None => fc.push(head),
    }
    Ok(fc)
}

/// Exponential moving average over detached tensors.
///
/// Tracks the aggregate posterior of a model instance; the value survives
/// for the lifetime of the owner and is only reset by reconstruction.
pub struct Ema {
    decay: f64,
    value: Option<Tensor>,
}

impl Ema {
    pub fn new(decay: f64) -> Self {
        Self { decay, value: None }
    }

    pub fn update(&mut self, x: &Tensor) -> Result<()> {
        let x = x.detach();
        self.value = Some(match self.value.take() {
            None => x,
            Some(prev) => ((prev * self.decay)? + (x * (1.0 - self.decay))?)?,
        });
        Ok(())
    }

    pub fn value(&self) -> Option<&Tensor> {
        self.value.as_ref()
    }
}
