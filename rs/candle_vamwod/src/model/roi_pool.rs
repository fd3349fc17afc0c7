//! Region of Interest max pooling
//!
//! Pure candle implementation of torchvision's `RoIPool`. Each box is mapped
//! from input pixels to feature-map cells with the spatial scale, split into
//! an `output_h x output_w` grid of bins, and every bin is max-pooled per
//! channel. Bins that fall outside the feature map produce zeros.
//!
//! Bin boundaries follow torchvision exactly:
//! - roi corners are rounded after scaling
//! - roi width/height are `end - start + 1`, at least 1
//! - bin `p` covers `[floor(p * bin), ceil((p + 1) * bin))` offset by the roi start
//!
//! Like torchvision, gradients flow back only through the maximum cell of
//! each bin.

use std::ops::Range;

use candle_core::{bail, DType, Result, Tensor};
use rayon::prelude::*;

#[derive(Debug, Clone, Copy)]
pub struct RoiPool {
    output_size: (usize, usize),
    spatial_scale: f32,
}

/// Feature-map cells covered by one output bin; `None` when the bin is empty.
pub type Bin = Option<(Range<usize>, Range<usize>)>;

impl RoiPool {
    pub fn new(output_size: (usize, usize), spatial_scale: f32) -> Self {
        Self {
            output_size,
            spatial_scale,
        }
    }

    pub fn spatial_scale(&self) -> f32 {
        self.spatial_scale
    }

    /// Length of the flattened pooled vector for `channels` input channels
    pub fn output_len(&self, channels: usize) -> usize {
        channels * self.output_size.0 * self.output_size.1
    }

    /// Bins of one box `[x1, y1, x2, y2]` on a `feat_h x feat_w` map, row-major.
    pub fn bins(&self, corners: [f32; 4], feat_h: usize, feat_w: usize) -> Vec<Bin> {
        let (out_h, out_w) = self.output_size;
        let [x1, y1, x2, y2] = corners.map(|v| (v * self.spatial_scale).round() as i64);

        let roi_h = (y2 - y1 + 1).max(1) as f32;
        let roi_w = (x2 - x1 + 1).max(1) as f32;
        let bin_h = roi_h / out_h as f32;
        let bin_w = roi_w / out_w as f32;

        let span = |p: usize, bin: f32, start: i64, limit: usize| -> Range<usize> {
            let lo = (p as f32 * bin).floor() as i64 + start;
            let hi = ((p + 1) as f32 * bin).ceil() as i64 + start;
            let clamp = |v: i64| v.clamp(0, limit as i64) as usize;
            clamp(lo)..clamp(hi)
        };

        let mut bins = Vec::with_capacity(out_h * out_w);
        for ph in 0..out_h {
            let rows = span(ph, bin_h, y1, feat_h);
            for pw in 0..out_w {
                let cols = span(pw, bin_w, x1, feat_w);
                if rows.is_empty() || cols.is_empty() {
                    bins.push(None);
                } else {
                    bins.push(Some((rows.clone(), cols)));
                }
            }
        }
        bins
    }

    /// Flat indices into `features.flatten_all()` of the maximum cell of every
    /// (box, channel, bin), channel-major per box. Empty bins point at
    /// `sentinel`. Ties keep the first cell in row-major order.
    fn argmax_cells(
        &self,
        values: &[f32],
        roi: &[f32; 5],
        dims: (usize, usize, usize),
        sentinel: u32,
    ) -> Vec<u32> {
        let (channels, feat_h, feat_w) = dims;
        let owner = roi[0] as usize;
        let bins = self.bins([roi[1], roi[2], roi[3], roi[4]], feat_h, feat_w);
        let plane = feat_h * feat_w;

        let mut cells = vec![sentinel; channels * bins.len()];
        for (b, bin) in bins.iter().enumerate() {
            let Some((rows, cols)) = bin else {
                continue;
            };
            for c in 0..channels {
                let base = (owner * channels + c) * plane;
                let mut best: Option<(f32, usize)> = None;
                for y in rows.clone() {
                    for x in cols.clone() {
                        let idx = base + y * feat_w + x;
                        match best {
                            Some((max, _)) if values[idx] <= max => {}
                            _ => best = Some((values[idx], idx)),
                        }
                    }
                }
                if let Some((_, idx)) = best {
                    cells[c * bins.len() + b] = idx as u32;
                }
            }
        }
        cells
    }

    /// Pool every box from its owning image's feature map.
    ///
    /// Maximum cells are located on a detached host copy of the maps; the
    /// pooled values are then one `index_select` on the flattened maps, so the
    /// backward pass is a single scatter-add onto those cells.
    ///
    /// # Arguments
    /// * `features` - Feature maps of shape [B, C, H, W]
    /// * `rois` - Rows of `[owner, x1, y1, x2, y2]` in input pixel coordinates
    ///
    /// # Returns
    /// Tensor of shape [N, C * output_h * output_w], channel-major per row
    pub fn forward(&self, features: &Tensor, rois: &[[f32; 5]]) -> Result<Tensor> {
        let (batch, channels, feat_h, feat_w) = features.dims4()?;
        let out_len = self.output_len(channels);
        if rois.is_empty() {
            return Tensor::zeros((0, out_len), features.dtype(), features.device());
        }
        for (i, roi) in rois.iter().enumerate() {
            let owner = roi[0];
            if owner < 0.0 || owner.fract() != 0.0 || owner as usize >= batch {
                bail!("roi {i} has owner index {owner}, expected an integer in [0, {batch})");
            }
        }

        let flat = features.flatten_all()?;
        let total = flat.elem_count();
        if total >= u32::MAX as usize {
            bail!("feature maps with {total} elements are too large to index");
        }
        let values: Vec<f32> = flat.detach().to_dtype(DType::F32)?.to_vec1()?;

        let dims = (channels, feat_h, feat_w);
        let sentinel = total as u32;
        let cells: Vec<u32> = rois
            .par_iter()
            .map(|roi| self.argmax_cells(&values, roi, dims, sentinel))
            .collect::<Vec<_>>()
            .concat();

        let cells = Tensor::from_vec(cells, rois.len() * out_len, features.device())?;
        let zero = Tensor::zeros(1, features.dtype(), features.device())?;
        Tensor::cat(&[&flat, &zero], 0)?
            .index_select(&cells, 0)?
            .reshape((rois.len(), out_len))
    }
}
