//! Capture configuration.
//!
//! Preview dimensions and the expected pixel format are read once per
//! open cycle. The lock timeout is fixed and not part of the file format.

use super::frame::PixelFormat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Bounded wait used for every open/close lock acquisition.
pub const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(2500);

/// Largest frame pool the controller will allocate.
pub const MAX_BUFFER_DEPTH: usize = 16;

/// Width and height of the preview stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PreviewSize {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl PreviewSize {
    /// Creates a preview size.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels in one frame.
    pub fn area(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}

impl Default for PreviewSize {
    fn default() -> Self {
        Self::new(1280, 720)
    }
}

impl fmt::Display for PreviewSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for PreviewSize {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| ConfigError::InvalidPreviewSize(s.to_string()))?;
        let width = w
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidPreviewSize(s.to_string()))?;
        let height = h
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidPreviewSize(s.to_string()))?;
        Ok(Self { width, height })
    }
}

/// Configuration for a capture session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Camera device index.
    pub device_id: u32,
    /// Preview width in pixels.
    pub preview_width: u32,
    /// Preview height in pixels.
    pub preview_height: u32,
    /// Number of frame slots in the output pool.
    pub buffer_depth: usize,
    /// Pixel format frames must carry to be delivered.
    pub pixel_format: PixelFormat,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            preview_width: 1280,
            preview_height: 720,
            buffer_depth: 3,
            pixel_format: PixelFormat::Private,
        }
    }
}

impl CaptureConfig {
    /// Creates a new configuration with the specified preview size.
    pub fn with_preview_size(size: PreviewSize) -> Self {
        Self {
            preview_width: size.width,
            preview_height: size.height,
            ..Default::default()
        }
    }

    /// Returns the configured preview size.
    pub fn preview_size(&self) -> PreviewSize {
        PreviewSize::new(self.preview_width, self.preview_height)
    }

    /// Returns the lock acquisition timeout. Always [`LOCK_ACQUIRE_TIMEOUT`].
    pub fn lock_timeout(&self) -> Duration {
        LOCK_ACQUIRE_TIMEOUT
    }

    /// Validates the configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.preview_width == 0 || self.preview_height == 0 {
            return Err(ConfigError::InvalidDimensions);
        }
        if self.buffer_depth == 0 || self.buffer_depth > MAX_BUFFER_DEPTH {
            return Err(ConfigError::InvalidBufferDepth(self.buffer_depth));
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Width or height is zero.
    #[error("invalid preview dimensions")]
    InvalidDimensions,
    /// Buffer depth outside 1..=16.
    #[error("invalid buffer depth {0} (must be 1-16)")]
    InvalidBufferDepth(usize),
    /// A size string did not parse.
    #[error("invalid preview size '{0}' (expected WIDTHxHEIGHT)")]
    InvalidPreviewSize(String),
    /// The config file could not be read.
    #[error("failed to read config file: {0}")]
    FileReadError(String),
    /// The config file is not valid TOML for this schema.
    #[error("failed to parse config file: {0}")]
    ParseError(String),
}

/// Full configuration file format.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileConfig {
    /// `[capture]` table.
    #[serde(default)]
    pub capture: CaptureConfig,
    /// `[run]` table.
    #[serde(default)]
    pub run: RunConfig,
}

/// Settings for the command-line runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Frames to stream before closing (0 runs until interrupted).
    pub frame_count: u64,
    /// Metrics server port (0 to disable).
    pub metrics_port: u16,
    /// Directory to dump delivered frames into.
    pub dump_dir: Option<PathBuf>,
    /// Maximum number of frames to dump.
    pub dump_limit: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            frame_count: 100,
            metrics_port: 9090,
            dump_dir: None,
            dump_limit: None,
        }
    }
}

impl FileConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileReadError(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Parses configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: FileConfig =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.capture.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = CaptureConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.preview_size(), PreviewSize::new(1280, 720));
        assert_eq!(config.buffer_depth, 3);
        assert_eq!(config.lock_timeout(), Duration::from_millis(2500));
    }

    #[test]
    fn test_zero_dimensions_invalid() {
        let mut config = CaptureConfig::default();
        config.preview_height = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDimensions)
        ));
    }

    #[test]
    fn test_buffer_depth_bounds() {
        let mut config = CaptureConfig::default();
        config.buffer_depth = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBufferDepth(0))
        ));
        config.buffer_depth = MAX_BUFFER_DEPTH + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_preview_size_parse() {
        let size: PreviewSize = "2560x1600".parse().unwrap();
        assert_eq!(size, PreviewSize::new(2560, 1600));
        assert_eq!(size.to_string(), "2560x1600");
        assert!("1280".parse::<PreviewSize>().is_err());
        assert!("axb".parse::<PreviewSize>().is_err());
    }

    #[test]
    fn test_file_config_partial_tables() {
        let config = FileConfig::from_toml(
            r#"
            [capture]
            preview_width = 640
            preview_height = 480
            pixel_format = "nv21"

            [run]
            frame_count = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.capture.preview_size(), PreviewSize::new(640, 480));
        assert_eq!(config.capture.pixel_format, PixelFormat::Nv21);
        assert_eq!(config.capture.buffer_depth, 3);
        assert_eq!(config.run.frame_count, 10);
        assert_eq!(config.run.metrics_port, 9090);
    }

    #[test]
    fn test_file_config_rejects_invalid_capture() {
        let result = FileConfig::from_toml("[capture]\nbuffer_depth = 0\n");
        assert!(matches!(result, Err(ConfigError::InvalidBufferDepth(0))));
    }
}
