use std::path::{Path, PathBuf};

use crate::types::StrataError;
use thiserror::Error;

/// Error type for administrative operations.
#[derive(Debug, Error)]
pub enum AdminError {
    /// Store file not found at the specified path.
    #[error("store not found: {0}")]
    MissingSegment(PathBuf),
    /// Store file already present where a new one was requested.
    #[error("store already exists: {0}")]
    AlreadyExists(PathBuf),
    /// Core storage error.
    #[error(transparent)]
    Core(#[from] StrataError),
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for administrative operations.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    pub(crate) fn missing_segment(path: impl AsRef<Path>) -> Self {
        AdminError::MissingSegment(path.as_ref().to_path_buf())
    }
}
