//! Shared foundations for the framesync crates.
//!
//! - Error type and result alias
//! - Logging initialization
//! - Timer used for frame pacing and wait measurements
//! - TOML configuration

mod config;
mod error;
mod logging;
mod timer;

pub use config::{
    Config, DEFAULT_CONFIG_FILE, DebugConfig, PoolConfig, SyncConfig, UploadConfig,
};
pub use error::{Error, Result};
pub use logging::{init_logging, init_logging_with_filter};
pub use timer::Timer;
