//! Image Preprocessing for VAMWOD
//!
//! This module handles the preprocessing pipeline for screenshots:
//! 1. Load image and convert to tensor (RGB, CHW format, values in [0, 1])
//! 2. Optionally normalize using ImageNet mean and std
//! 3. Resize to the model's square input resolution

use std::path::Path;

use candle_core::{Device, Result, Tensor};
use image::DynamicImage;
use tracing::debug;

/// ImageNet normalization mean values (RGB order)
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet normalization std values (RGB order)
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Convert a DynamicImage to a tensor in CHW format with values in [0, 1]
///
/// # Returns
/// Tensor of shape [3, H, W] with values in [0.0, 1.0]
pub fn image_to_tensor(img: &DynamicImage, device: &Device) -> Result<Tensor> {
    let img = img.to_rgb8();
    let (width, height) = img.dimensions();
    let (h, w) = (height as usize, width as usize);

    // Raw data is HWC: [R, G, B, R, G, B, ...] row by row
    let raw_data = img.into_raw();
    let mut chw_data = vec![0.0f32; 3 * h * w];
    for (pixel, rgb) in raw_data.chunks_exact(3).enumerate() {
        for (c, &value) in rgb.iter().enumerate() {
            chw_data[c * h * w + pixel] = value as f32 / 255.0;
        }
    }

    Tensor::from_vec(chw_data, (3, h, w), device)
}

/// Normalize a [3, H, W] tensor using ImageNet mean and std
pub fn normalize(tensor: &Tensor) -> Result<Tensor> {
    let device = tensor.device();
    let mean = Tensor::from_slice(&IMAGENET_MEAN, (3, 1, 1), device)?;
    let std = Tensor::from_slice(&IMAGENET_STD, (3, 1, 1), device)?;
    tensor.broadcast_sub(&mean)?.broadcast_div(&std)
}

/// Resize a [3, H, W] tensor to (target_h, target_w) using bilinear interpolation
pub fn resize(tensor: &Tensor, target_size: (usize, usize)) -> Result<Tensor> {
    let (target_h, target_w) = target_size;
    let (_, h, w) = tensor.dims3()?;
    if (h, w) == (target_h, target_w) {
        return Ok(tensor.clone());
    }

    // upsample_bilinear2d expects [N, C, H, W]; align_corners=false
    tensor
        .unsqueeze(0)?
        .upsample_bilinear2d(target_h, target_w, false)?
        .squeeze(0)
}

/// A screenshot prepared for the backbone.
#[derive(Debug)]
pub struct PreparedImage {
    /// Tensor of shape [3, img_size, img_size]
    pub tensor: Tensor,
    /// Height of the image on disk
    pub orig_h: usize,
    /// Width of the image on disk
    pub orig_w: usize,
}

impl PreparedImage {
    /// Factors mapping on-disk pixel coordinates to model input coordinates
    pub fn box_scale(&self, img_size: usize) -> (f32, f32) {
        (
            img_size as f32 / self.orig_w as f32,
            img_size as f32 / self.orig_h as f32,
        )
    }
}

/// Full preprocessing pipeline: load, convert to tensor, normalize, and resize
pub fn preprocess_image(
    image_path: &Path,
    img_size: usize,
    normalize_input: bool,
    device: &Device,
) -> anyhow::Result<PreparedImage> {
    let img = image::open(image_path)?;
    let tensor = image_to_tensor(&img, device)?;
    let (_, orig_h, orig_w) = tensor.dims3()?;

    let tensor = if normalize_input {
        normalize(&tensor)?
    } else {
        tensor
    };
    let tensor = resize(&tensor, (img_size, img_size))?;
    debug!(
        "preprocessed {:?}: {}x{} -> {:?}",
        image_path,
        orig_w,
        orig_h,
        tensor.dims()
    );

    Ok(PreparedImage {
        tensor,
        orig_h,
        orig_w,
    })
}
