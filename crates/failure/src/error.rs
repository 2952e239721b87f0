use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FailureError {
    #[error("failure log io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode failure event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("event error is required")]
    MissingError,
    #[error("event id is required")]
    MissingId,
    #[error("failure event {0:?} not found")]
    NotFound(String),
}
