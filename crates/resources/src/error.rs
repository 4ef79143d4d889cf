//! Error types for resource creation.

use std::path::PathBuf;

use framesync_rhi::RhiError;
use thiserror::Error;

/// Error type for texture and font atlas creation.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// Device-level failure: creation, recording, submission or a wait.
    #[error("Device error: {0}")]
    Rhi(#[from] RhiError),

    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding error.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// File not found.
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    /// Caller-supplied data is inconsistent, e.g. a glyph outside its atlas.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias for resource operations.
pub type ResourceResult<T> = Result<T, ResourceError>;
