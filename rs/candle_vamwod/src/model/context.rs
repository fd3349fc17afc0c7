//! Context Attentive Network
//!
//! Builds a context representation for every box from the own-feature vectors
//! of its neighbours, as listed by a [`ContextTable`]. Two variants:
//! - single-hop additive attention (GAT-style, https://arxiv.org/abs/1710.10903)
//! - plain mean of the valid neighbours' own features
//!
//! Neighbour features are gathered from the own-feature table extended with
//! one all-zero row. Empty slots (`-1`) are remapped explicitly to that row
//! before `index_select`; negative indices are never handed to the tensor
//! library.
//!
//! Rows without a single valid neighbour produce all-zero attention weights
//! and therefore a zero context vector. The mean variant divides by the number
//! of valid neighbours floored at 1, which also yields a zero vector.

use candle_core::{Device, Result, Tensor, D};
use candle_nn::{linear, linear_no_bias, Activation, Linear, Module, VarBuilder};
use webtools::ContextTable;

use crate::config::{ContextMode, VamwodConfig};

/// Score given to empty neighbour slots before the softmax
const MASKED_SCORE: f32 = -9e15;

/// Device-side view of a validated [`ContextTable`].
#[derive(Debug)]
pub struct ContextGather {
    /// Indices into the padded feature table, [N * n_context] (u32)
    indices: Tensor,
    /// 1 for a filled slot, [N, n_context] (u8)
    mask: Tensor,
    /// Valid neighbours per box floored at 1, [N, 1] (f32)
    counts: Tensor,
    /// 1 if the box has at least one neighbour, [N, 1] (f32)
    has_neighbor: Tensor,
    n_boxes: usize,
    n_context: usize,
}

impl ContextGather {
    /// `table` must already be validated against the batch's owners.
    pub fn new(table: &ContextTable, device: &Device) -> Result<Self> {
        let (n_boxes, n_context) = (table.n_boxes(), table.n_context());
        let counts = table.valid_counts();

        let indices = Tensor::from_vec(table.padded_indices(), n_boxes * n_context, device)?;
        let mask = Tensor::from_vec(table.valid_mask(), (n_boxes, n_context), device)?;
        let has_neighbor: Vec<f32> = counts.iter().map(|&c| if c > 0 { 1.0 } else { 0.0 }).collect();
        let has_neighbor = Tensor::from_vec(has_neighbor, (n_boxes, 1), device)?;
        let counts: Vec<f32> = counts.iter().map(|&c| c.max(1) as f32).collect();
        let counts = Tensor::from_vec(counts, (n_boxes, 1), device)?;

        Ok(Self {
            indices,
            mask,
            counts,
            has_neighbor,
            n_boxes,
            n_context,
        })
    }

    pub fn n_context(&self) -> usize {
        self.n_context
    }

    /// Gather neighbour rows of `features` [N, F] into [N, n_context, F];
    /// empty slots read the appended zero row.
    pub fn gather(&self, features: &Tensor) -> Result<Tensor> {
        let (n, f) = features.dims2()?;
        if n != self.n_boxes {
            candle_core::bail!(
                "context table has {} rows but features have {} rows",
                self.n_boxes,
                n
            );
        }
        let zero_row = Tensor::zeros((1, f), features.dtype(), features.device())?;
        let padded = Tensor::cat(&[features, &zero_row], 0)?;
        padded
            .index_select(&self.indices, 0)?
            .reshape((n, self.n_context, f))
    }

    /// Mean of valid neighbour features, [N, F]
    pub fn mean(&self, features: &Tensor) -> Result<Tensor> {
        self.gather(features)?.sum(1)?.broadcast_div(&self.counts)
    }
}

/// Single-hop additive attention over a fixed list of neighbours
#[derive(Debug)]
pub struct ContextAttention {
    w_i: Linear,
    w_j: Linear,
    attention_layer: Linear,
    leaky_relu: Activation,
    hidden_dim: usize,
}

impl ContextAttention {
    /// Weight path: `W_i`, `W_j` (no bias), `attention_layer`
    pub fn load(vb: VarBuilder, in_features: usize, hidden_dim: usize, slope: f64) -> Result<Self> {
        let w_i = linear_no_bias(in_features, hidden_dim, vb.pp("W_i"))?;
        let w_j = linear_no_bias(in_features, hidden_dim, vb.pp("W_j"))?;
        let attention_layer = linear(2 * hidden_dim, 1, vb.pp("attention_layer"))?;
        Ok(Self {
            w_i,
            w_j,
            attention_layer,
            leaky_relu: Activation::LeakyRelu(slope),
            hidden_dim,
        })
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// Context representation [N, hidden_dim] and attention weights [N, n_context].
    pub fn forward_with_weights(
        &self,
        h_i: &Tensor,
        gather: &ContextGather,
    ) -> Result<(Tensor, Tensor)> {
        let (n, _) = h_i.dims2()?;
        let k = gather.n_context();

        let h_j = gather.gather(h_i)?; // [N, k, F]
        let wh_i = self.w_i.forward(h_i)?; // [N, d]
        let wh_j = self.w_j.forward(&h_j)?; // [N, k, d]

        let wh_i_repeated = wh_i
            .unsqueeze(1)?
            .broadcast_as((n, k, self.hidden_dim))?
            .contiguous()?;
        let pairs = Tensor::cat(&[&wh_i_repeated, &wh_j], 2)?; // [N, k, 2d]
        let scores = self.attention_layer.forward(&pairs)?.squeeze(2)?; // [N, k]
        let scores = self.leaky_relu.forward(&scores)?;

        let masked = Tensor::full(MASKED_SCORE, (n, k), h_i.device())?.to_dtype(scores.dtype())?;
        let scores = gather.mask.where_cond(&scores, &masked)?;
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        // Rows with no neighbour at all get zero weights, not a uniform split.
        let weights = weights.broadcast_mul(&gather.has_neighbor.to_dtype(weights.dtype())?)?;

        let h_prime = weights.unsqueeze(2)?.broadcast_mul(&wh_j)?.sum(1)?; // [N, d]
        Ok((h_prime, weights))
    }

    pub fn forward(&self, h_i: &Tensor, gather: &ContextGather) -> Result<Tensor> {
        self.forward_with_weights(h_i, gather).map(|(h_prime, _)| h_prime)
    }
}

/// Context representation selected by [`ContextMode`]
#[derive(Debug)]
pub enum ContextEncoder {
    Disabled,
    Attention(ContextAttention),
    Mean,
}

impl ContextEncoder {
    pub fn load(vb: VarBuilder, config: &VamwodConfig, n_feat: usize) -> Result<Self> {
        Ok(match config.context_mode() {
            ContextMode::Disabled => ContextEncoder::Disabled,
            ContextMode::Attention => ContextEncoder::Attention(ContextAttention::load(
                vb.pp("gat"),
                n_feat,
                config.hidden_dim,
                config.attention_slope,
            )?),
            ContextMode::Mean => ContextEncoder::Mean,
        })
    }

    /// Width of the context representation for own features of width `n_feat`
    pub fn output_dim(&self, n_feat: usize) -> usize {
        match self {
            ContextEncoder::Disabled => 0,
            ContextEncoder::Attention(attention) => attention.hidden_dim(),
            ContextEncoder::Mean => n_feat,
        }
    }

    /// `None` when context is disabled.
    pub fn forward(&self, own_features: &Tensor, gather: &ContextGather) -> Result<Option<Tensor>> {
        match self {
            ContextEncoder::Disabled => Ok(None),
            ContextEncoder::Attention(attention) => attention.forward(own_features, gather).map(Some),
            ContextEncoder::Mean => gather.mean(own_features).map(Some),
        }
    }
}
