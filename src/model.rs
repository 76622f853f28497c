use burn::{prelude::*, tensor::activation::relu};
use nn::{Dropout, DropoutConfig, Linear, LinearConfig};

use crate::{
    data::GraphBatch,
    module::graph_conv::{GraphConv, GraphConvConfig},
};

/// Graph classifier over part-graph batches: a stack of graph convolutions
/// with dropout in between, mean pooling per graph, and a linear head
/// producing one logit per machining-feature class.
#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    input: GraphConv<B>,
    convs: Vec<GraphConv<B>>,
    dropout: Dropout,
    head: Linear<B>,
}

impl<B: Backend> Model<B> {
    pub fn forward(&self, batch: &GraphBatch<B>) -> Tensor<B, 2> {
        let mut x = relu(self.input.forward(batch.node_features.clone(), &batch.adjacency));

        for conv in &self.convs {
            x = self.dropout.forward(x);
            x = relu(conv.forward(x, &batch.adjacency));
        }

        let pooled = batch.pooling.clone().matmul(x);
        self.head.forward(pooled)
    }
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    pub feature_dim: usize,

    pub class_count: usize,

    pub conv_layer_count: usize,

    pub hidden_channels: usize,

    pub dropout: f64,
}

impl ModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Model<B> {
        let input = GraphConvConfig::new([self.feature_dim, self.hidden_channels]).init(device);
        let convs = (1..self.conv_layer_count)
            .map(|_| {
                GraphConvConfig::new([self.hidden_channels, self.hidden_channels]).init(device)
            })
            .collect();

        Model {
            input,
            convs,
            dropout: DropoutConfig::new(self.dropout).init(),
            head: LinearConfig::new(self.hidden_channels, self.class_count).init(device),
        }
    }
}
