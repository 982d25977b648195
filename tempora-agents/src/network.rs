use candle_core::{Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder, linear};

#[derive(Debug, Clone)]
pub enum ThreadSafeLayer {
    Linear(Linear),
    Activation(Activation),
}

impl Module for ThreadSafeLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Linear(linear) => linear.forward(xs),
            Self::Activation(activation) => activation.forward(xs),
        }
    }
}

/// `candle_nn::Sequential` boxes its layers as plain trait objects, which cannot cross a
/// thread boundary. Acquisition units move to worker threads, so layers are kept in an enum.
#[derive(Default, Debug, Clone)]
pub struct ThreadSafeSequential {
    layers: Vec<ThreadSafeLayer>,
}

impl ThreadSafeSequential {
    pub fn add_layer(mut self, layer: ThreadSafeLayer) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for ThreadSafeSequential {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for layer in self.layers.iter() {
            xs = layer.forward(&xs)?
        }
        Ok(xs)
    }
}

/// MLP with ReLU between layers and a linear output. `layers` lists the output size of every
/// layer, the last entry being the network output.
pub fn build_sequential(
    input_dim: usize,
    layers: &[usize],
    vb: &VarBuilder,
    prefix: &str,
) -> Result<ThreadSafeSequential> {
    let mut last_dim = input_dim;
    let mut nn = ThreadSafeSequential::default();
    let num_layers = layers.len();
    for (layer_idx, layer_size) in layers.iter().enumerate() {
        let layer = linear(last_dim, *layer_size, vb.pp(format!("{prefix}{layer_idx}")))?;
        nn = nn.add_layer(ThreadSafeLayer::Linear(layer));
        if layer_idx != num_layers - 1 {
            nn = nn.add_layer(ThreadSafeLayer::Activation(Activation::Relu));
        }
        last_dim = *layer_size;
    }
    Ok(nn)
}
