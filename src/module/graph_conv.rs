use burn::{module::Module, nn::Linear, prelude::*};
use nn::LinearConfig;

/// Dense GCN-style convolution: `A_hat (X W)`, where `A_hat` is the
/// symmetrically normalized adjacency built by the batcher.
#[derive(Module, Debug)]
pub struct GraphConv<B: Backend> {
    linear: Linear<B>,
}

impl<B: Backend> GraphConv<B> {
    pub fn forward(&self, x: Tensor<B, 2>, adjacency: &Tensor<B, 2>) -> Tensor<B, 2> {
        adjacency.clone().matmul(self.linear.forward(x))
    }
}

#[derive(Config, Debug)]
pub struct GraphConvConfig {
    channels: [usize; 2],

    #[config(default = true)]
    bias: bool,
}

impl GraphConvConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> GraphConv<B> {
        GraphConv {
            linear: LinearConfig::new(self.channels[0], self.channels[1])
                .with_bias(self.bias)
                .init(device),
        }
    }
}
