//! Error types shared by the framesync crates.

use thiserror::Error;

/// Top-level error type for configuration and process setup.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be read or is invalid
    #[error("Config error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using the core Error type.
pub type Result<T> = std::result::Result<T, Error>;
