//! Dataset tooling for webpage object detection.
//!
//! This crate provides the tensor-free half of the data pipeline:
//! - Box geometry and the on-disk sample metadata format
//! - Background-box subsampling with an explicit random source
//! - Train/val/test split lists with overlap checking
//! - Flattening of variable-length per-sample box lists into one batch
//! - Per-box neighbour (context) tables and their validation
//! - Per-class top-1 accuracy

pub mod boxes;
pub mod collate;
pub mod context;
pub mod error;
pub mod eval;
pub mod sample;
pub mod split;

pub use boxes::BBox;
pub use collate::BoxBatch;
pub use context::{ContextTable, NO_CONTEXT};
pub use error::{Result, WebToolsError};
pub use eval::{top_box_per_class, AccuracyReport, ClassAccuracy};
pub use sample::{BackgroundCap, SampleBoxes, SampleMeta, BACKGROUND_LABEL, GT_LABELS};
pub use split::{Split, Splits};
