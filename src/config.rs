//! Engine configuration
//!
//! Loaded from TOML. Every field has a default, so a partial file (or no
//! file at all) is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::constants::{
    DEFAULT_CAPTURE_SAMPLE_RATE, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_QUEUE_DEPTH,
    DEFAULT_READ_TIMEOUT_MS, DEVICE_POLL_INTERVAL_MS,
};
use crate::error::{Error, Result};

const CONFIG_FILE_NAME: &str = "config.toml";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub capture: CaptureConfig,
    pub streaming: StreamingConfig,
    pub playback: PlaybackConfig,
    pub network: NetworkConfig,
}

/// What a capture producer does when the chunk queue is full
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait for the consumer; nothing is lost
    #[default]
    Block,
    /// Evict the oldest queued chunk
    DropOldest,
}

/// Microphone capture settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    /// Chunks buffered between the device worker and the consumer
    pub queue_depth: usize,
    pub backpressure: BackpressurePolicy,
    /// How long a device read waits before re-checking for shutdown
    pub poll_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_CAPTURE_SAMPLE_RATE,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            backpressure: BackpressurePolicy::Block,
            poll_interval_ms: DEVICE_POLL_INTERVAL_MS,
        }
    }
}

impl CaptureConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Streaming playback settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamingConfig {
    pub queue_depth: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// File playback settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Volume used when `play` is called without one
    pub default_volume: f32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self { default_volume: 1.0 }
    }
}

/// HTTP source settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub connect_timeout_ms: u64,
    /// Applies to each read of the response body
    pub read_timeout_ms: u64,
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl EngineConfig {
    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        debug!("Loaded config from {}", path.display());
        Self::from_toml(&text)
    }

    /// Per-user config location, e.g. `~/.config/sound-engine/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", env!("CARGO_PKG_NAME"))
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Load `path`, or the per-user file, falling back to defaults when
    /// neither exists. A file that exists but is invalid is still an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path().filter(|p| p.exists()),
        };

        match path {
            Some(path) => Self::load(&path),
            None => {
                info!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.capture.sample_rate == 0 {
            return Err(Error::Config("capture.sample_rate must be > 0".to_string()));
        }
        if self.capture.queue_depth == 0 {
            return Err(Error::Config("capture.queue_depth must be > 0".to_string()));
        }
        if self.capture.poll_interval_ms == 0 {
            return Err(Error::Config("capture.poll_interval_ms must be > 0".to_string()));
        }
        if self.streaming.queue_depth == 0 {
            return Err(Error::Config("streaming.queue_depth must be > 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.playback.default_volume) {
            return Err(Error::Config(
                "playback.default_volume must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.network.connect_timeout_ms == 0 || self.network.read_timeout_ms == 0 {
            return Err(Error::Config("network timeouts must be > 0".to_string()));
        }
        Ok(())
    }
}
