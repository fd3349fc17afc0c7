//! Per-box classifier
//!
//! Dropout -> Linear(T, T) -> BatchNorm1d -> ReLU -> Dropout -> Linear(T, n_classes)
//!
//! Indices in the weight names (`decoder.1`, `decoder.2`, `decoder.5`) follow
//! the position of each layer in the sequence.

use candle_core::{ModuleT, Result, Tensor};
use candle_nn::{batch_norm, linear, BatchNorm, Dropout, Linear, Module, VarBuilder};

#[derive(Debug)]
pub struct ClassifierHead {
    dropout: Dropout,
    hidden: Linear,
    bn: BatchNorm,
    output: Linear,
    in_features: usize,
}

impl ClassifierHead {
    pub fn load(vb: VarBuilder, in_features: usize, n_classes: usize, drop_prob: f32) -> Result<Self> {
        let hidden = linear(in_features, in_features, vb.pp("1"))?;
        let bn = batch_norm(in_features, 1e-5, vb.pp("2"))?;
        let output = linear(in_features, n_classes, vb.pp("5"))?;
        Ok(Self {
            dropout: Dropout::new(drop_prob),
            hidden,
            bn,
            output,
            in_features,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }
}

impl ModuleT for ClassifierHead {
    /// Maps features [N, T] to class logits [N, n_classes]
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.dropout.forward_t(xs, train)?;
        let xs = self.hidden.forward(&xs)?;
        let xs = self.bn.forward_t(&xs, train)?.relu()?;
        let xs = self.dropout.forward_t(&xs, train)?;
        self.output.forward(&xs)
    }
}
