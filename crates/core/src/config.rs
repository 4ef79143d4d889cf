//! Configuration loaded from `framesync.toml`.
//!
//! Every field has a default, so a missing file or a partial file is fine.
//! A present but malformed file is an error rather than a silent fallback.

use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "framesync.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub pools: PoolConfig,
    pub upload: UploadConfig,
    pub debug: DebugConfig,
}

/// Frames-in-flight settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Number of frame slots in the ring. 2 is double buffering, 3 trades
    /// latency for throughput.
    pub max_frames_in_flight: usize,
    /// Timeout for the per-frame fence wait in milliseconds. 0 waits forever.
    pub fence_timeout_ms: u64,
    /// Image count of the offscreen present target.
    pub offscreen_images: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 2,
            fence_timeout_ms: 0,
            offscreen_images: 3,
        }
    }
}

impl SyncConfig {
    /// Fence timeout in nanoseconds as expected by fence waits.
    pub fn fence_timeout_ns(&self) -> u64 {
        if self.fence_timeout_ms == 0 {
            u64::MAX
        } else {
            self.fence_timeout_ms.saturating_mul(1_000_000)
        }
    }
}

/// Command pool maintenance settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Return pool memory to the system on bulk resets.
    pub release_resources_on_reset: bool,
    /// Trim every pool after a bulk reset.
    pub trim_after_reset: bool,
}

/// Upload settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Sampler filter for uploaded textures: "linear" or "nearest".
    pub default_filter: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            default_filter: "linear".to_string(),
        }
    }
}

/// Debug settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    /// Fallback tracing filter when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from [`DEFAULT_CONFIG_FILE`].
    pub fn load() -> Result<Self> {
        Self::load_from_path(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from a specific path.
    ///
    /// A missing file yields the defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;

        info!("Loaded configuration from {:?}", path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| Error::Config(e.message().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.sync.max_frames_in_flight == 0 {
            return Err(Error::Config(
                "sync.max_frames_in_flight must be at least 1".to_string(),
            ));
        }
        if self.sync.offscreen_images == 0 {
            return Err(Error::Config(
                "sync.offscreen_images must be at least 1".to_string(),
            ));
        }
        match self.upload.default_filter.as_str() {
            "linear" | "nearest" => Ok(()),
            other => Err(Error::Config(format!(
                "upload.default_filter must be \"linear\" or \"nearest\", got \"{}\"",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sync.max_frames_in_flight, 2);
        assert_eq!(config.sync.fence_timeout_ns(), u64::MAX);
        assert!(!config.pools.release_resources_on_reset);
        assert_eq!(config.upload.default_filter, "linear");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [sync]
            max_frames_in_flight = 3
            fence_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.max_frames_in_flight, 3);
        assert_eq!(config.sync.fence_timeout_ns(), 250_000_000);
        assert_eq!(config.sync.offscreen_images, 3);
        assert!(config.debug.validation_layers);
    }

    #[test]
    fn test_zero_frames_in_flight_rejected() {
        let err = Config::from_toml_str("[sync]\nmax_frames_in_flight = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_unknown_filter_rejected() {
        let err = Config::from_toml_str("[upload]\ndefault_filter = \"cubic\"\n").unwrap_err();
        assert!(err.to_string().contains("default_filter"));
    }

    #[test]
    fn test_malformed_toml_rejected() {
        assert!(Config::from_toml_str("[sync\nmax_frames_in_flight = 2").is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load_from_path("does/not/exist/framesync.toml").unwrap();
        assert_eq!(config.sync.max_frames_in_flight, 2);
    }
}
