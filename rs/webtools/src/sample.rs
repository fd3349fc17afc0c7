//! Per-sample box metadata and background sampling.
//!
//! Each screenshot `x.png` is paired with `x.json` holding two box groups in
//! `[x, y, width, height]` form:
//! - `gt_boxes`: exactly three ground-truth boxes, labelled 1, 2 and 3 in order
//! - `other_boxes`: any number of background candidates, labelled 0

use std::path::Path;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::boxes::BBox;
use crate::error::{Result, WebToolsError};
use crate::split::Split;

/// Label of every background box.
pub const BACKGROUND_LABEL: u32 = 0;

/// Labels of the ground-truth boxes, in the order they are stored.
pub const GT_LABELS: [u32; 3] = [1, 2, 3];

/// Raw contents of a sample's metadata file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleMeta {
    pub gt_boxes: Vec<[f32; 4]>,
    pub other_boxes: Vec<[f32; 4]>,
}

/// Upper bound on the number of background boxes kept per sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackgroundCap {
    #[default]
    Unlimited,
    AtMost(usize),
}

impl BackgroundCap {
    /// Interpret a command-line style cap where `-1` (or any value < 1)
    /// disables subsampling.
    pub fn from_signed(cap: i64) -> Self {
        if cap > 0 {
            BackgroundCap::AtMost(cap as usize)
        } else {
            BackgroundCap::Unlimited
        }
    }

    /// Reject positive caps on evaluation splits.
    pub fn check_split(&self, split: Split) -> Result<()> {
        match *self {
            BackgroundCap::AtMost(cap) if !split.allows_background_cap() => {
                Err(WebToolsError::CapOnEvalSplit { cap, split })
            }
            _ => Ok(()),
        }
    }
}

/// Boxes and labels of one sample: the three ground-truth boxes first,
/// followed by the background boxes.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBoxes {
    pub boxes: Vec<BBox>,
    pub labels: Vec<u32>,
}

impl SampleBoxes {
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn num_background(&self) -> usize {
        self.labels
            .iter()
            .filter(|&&l| l == BACKGROUND_LABEL)
            .count()
    }

    /// Index of the box carrying `label`, if any.
    pub fn position_of(&self, label: u32) -> Option<usize> {
        self.labels.iter().position(|&l| l == label)
    }

    /// Rescale every box, e.g. after resizing the screenshot.
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            boxes: self.boxes.iter().map(|b| b.scale(sx, sy)).collect(),
            labels: self.labels.clone(),
        }
    }
}

impl SampleMeta {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| WebToolsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| WebToolsError::Metadata {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Convert stored boxes to corner form and attach labels.
    ///
    /// With a cap, the background boxes are shuffled with `rng` and truncated;
    /// ground-truth boxes are never dropped.
    pub fn into_sample_boxes<R: Rng + ?Sized>(
        self,
        id: &str,
        cap: BackgroundCap,
        rng: &mut R,
    ) -> Result<SampleBoxes> {
        if self.gt_boxes.len() != GT_LABELS.len() {
            return Err(WebToolsError::GroundTruthCount {
                id: id.to_string(),
                found: self.gt_boxes.len(),
            });
        }

        let mut other = self.other_boxes;
        if let BackgroundCap::AtMost(cap) = cap {
            other.shuffle(rng);
            other.truncate(cap);
        }

        let boxes: Vec<BBox> = self
            .gt_boxes
            .iter()
            .chain(other.iter())
            .map(|&xywh| BBox::from_xywh(xywh))
            .collect();

        if let Some((index, b)) = boxes.iter().enumerate().find(|(_, b)| b.is_degenerate()) {
            return Err(WebToolsError::DegenerateBox {
                id: id.to_string(),
                index,
                width: b.width(),
                height: b.height(),
            });
        }

        let mut labels = GT_LABELS.to_vec();
        labels.resize(boxes.len(), BACKGROUND_LABEL);

        Ok(SampleBoxes { boxes, labels })
    }
}
