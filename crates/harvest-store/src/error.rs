use std::path::PathBuf;
use thiserror::Error;

/// Errors from the export workspace layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Workspace {0} is in use by another run (could not take .lock)")]
    WorkspaceLocked(PathBuf),

    #[error(
        "Sub-export {dir} was made with different parameters; \
         finish or remove it before starting a new export"
    )]
    ParamsMismatch { dir: PathBuf },

    #[error("Malformed NDJSON at {path}:{line}: {source}")]
    MalformedLine {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },

    #[error("Metadata error in {dir}: {message}")]
    Metadata { dir: PathBuf, message: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
