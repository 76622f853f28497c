use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid dataset: {0}")]
    Dataset(String),

    #[error("dataset at {0} is empty")]
    EmptyDataset(PathBuf),

    #[error("slice {start}..{end} out of range for dataset of {len} samples")]
    SliceOutOfRange {
        start: usize,
        end: usize,
        len: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to record model weights: {0}")]
    Recorder(#[from] burn::record::RecorderError),

    #[error("tracking sink: {0}")]
    Tracking(String),
}

pub type Result<T> = std::result::Result<T, Error>;
