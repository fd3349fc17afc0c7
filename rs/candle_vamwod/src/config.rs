//! VAMWOD model configuration
//!
//! This module defines the configuration of the detection head and the input
//! pipeline feeding it. Configurations are plain JSON files; any field left
//! out takes its value from [`VamwodConfig::default`].

use std::path::Path;

use serde::{Deserialize, Serialize};

/// How the context representation of a box is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    /// No context; the classifier sees only the box's own features.
    Disabled,
    /// Attention-weighted sum of projected neighbour features.
    Attention,
    /// Plain mean of the neighbours' own features.
    Mean,
}

/// Configuration for VAMWOD models
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VamwodConfig {
    // Input configuration
    /// Side of the square image fed to the backbone
    pub img_size: usize,
    /// Apply ImageNet mean/std normalization after converting to [0, 1]
    pub normalize_input: bool,

    // Representation network
    /// Region pooling output grid (height, width)
    pub roi_output_size: (usize, usize),
    /// Whether to encode [x, y, w, h, aspect ratio] of each box
    pub use_bbox_feat: bool,
    /// Size of the box geometry embedding
    pub bbox_hidden_dim: usize,
    /// Number of externally supplied features per box
    pub n_additional_feat: usize,

    // Context network
    /// Whether to use neighbouring boxes at all
    pub use_context: bool,
    /// Attention over neighbours (true) or plain mean (false)
    pub use_attention: bool,
    /// Size of the attention context representation
    pub hidden_dim: usize,
    /// Negative slope of the LeakyReLU applied to attention scores
    pub attention_slope: f64,
    /// Number of neighbour slots per box
    pub n_context: usize,

    // Classifier
    /// Number of output classes, background included
    pub n_classes: usize,
    /// Dropout probability in the classifier
    pub drop_prob: f32,
    /// Display names of the classes, indexed by label
    pub class_names: Vec<String>,
}

impl Default for VamwodConfig {
    fn default() -> Self {
        Self {
            img_size: 1280,
            normalize_input: false,
            roi_output_size: (7, 7),
            use_bbox_feat: true,
            bbox_hidden_dim: 32,
            n_additional_feat: 0,
            use_context: true,
            use_attention: true,
            hidden_dim: 384,
            attention_slope: 0.2,
            n_context: 6,
            n_classes: 4,
            drop_prob: 0.2,
            class_names: ["BG", "Price", "Title", "Image"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl VamwodConfig {
    /// Load a configuration from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.img_size == 0 || self.roi_output_size.0 == 0 || self.roi_output_size.1 == 0 {
            anyhow::bail!("img_size and roi_output_size must be positive");
        }
        if self.n_classes < 2 {
            anyhow::bail!("n_classes must be at least 2, got {}", self.n_classes);
        }
        if self.class_names.len() != self.n_classes {
            anyhow::bail!(
                "class_names has {} entries for {} classes",
                self.class_names.len(),
                self.n_classes
            );
        }
        if !(0.0..1.0).contains(&self.drop_prob) {
            anyhow::bail!("drop_prob must be in [0, 1), got {}", self.drop_prob);
        }
        if self.use_context && self.n_context == 0 {
            anyhow::bail!("n_context must be positive when context is enabled");
        }
        if self.use_context && self.use_attention && self.hidden_dim == 0 {
            anyhow::bail!("hidden_dim must be positive when attention is enabled");
        }
        if self.use_bbox_feat && self.bbox_hidden_dim == 0 {
            anyhow::bail!("bbox_hidden_dim must be positive when box features are enabled");
        }
        Ok(())
    }

    /// `use_attention` only matters when context is enabled.
    pub fn context_mode(&self) -> ContextMode {
        match (self.use_context, self.use_attention) {
            (false, _) => ContextMode::Disabled,
            (true, true) => ContextMode::Attention,
            (true, false) => ContextMode::Mean,
        }
    }

    /// Width of the box geometry embedding (0 when disabled)
    pub fn n_bbox_feat(&self) -> usize {
        if self.use_bbox_feat {
            self.bbox_hidden_dim
        } else {
            0
        }
    }

    pub fn class_name(&self, label: usize) -> String {
        self.class_names
            .get(label)
            .cloned()
            .unwrap_or_else(|| label.to_string())
    }
}
