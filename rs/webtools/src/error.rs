//! Error type shared by the dataset tooling.

use std::path::PathBuf;

use thiserror::Error;

use crate::split::Split;

/// Errors raised while reading, sampling or batching webpage samples.
#[derive(Debug, Error)]
pub enum WebToolsError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed metadata in {path:?}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("sample {id}: expected 3 ground-truth boxes, found {found}")]
    GroundTruthCount { id: String, found: usize },

    #[error("sample {id}: box {index} has degenerate size {width}x{height}")]
    DegenerateBox {
        id: String,
        index: usize,
        width: f32,
        height: f32,
    },

    #[error("sample id {id:?} appears in both the {first} and {second} splits")]
    SplitOverlap {
        id: String,
        first: Split,
        second: Split,
    },

    #[error("background cap {cap} is only allowed on the train split, got {split}")]
    CapOnEvalSplit { cap: usize, split: Split },

    #[error("invalid context table: {0}")]
    Context(String),
}

pub type Result<T> = std::result::Result<T, WebToolsError>;
