//! Capture configuration

use std::path::Path;
use std::time::Duration;

use ::config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{CaptureError, Result};
use crate::traits::PixelFormat;

/// Capture configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device path (e.g., "/dev/video0")
    pub device: String,
    /// Capture width
    pub width: u32,
    /// Capture height
    pub height: u32,
    /// Pixel encoding
    pub format: PixelFormat,
    /// Target bitrate (bps)
    pub bitrate: u32,
    /// Readiness wait per frame, in seconds
    pub timeout_secs: u64,
    /// Frames to acquire before stopping
    pub frame_count: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_owned(),
            width: 1920,
            height: 1080,
            format: PixelFormat::H264,
            bitrate: 2_000_000,
            timeout_secs: 2,
            frame_count: 30,
        }
    }
}

impl CaptureConfig {
    /// Load defaults, then an optional TOML file, then `CAPTURE_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config = builder
            .add_source(Environment::with_prefix("CAPTURE").try_parsing(true))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Reject values no device could accept.
    pub fn validate(&self) -> Result<()> {
        if self.device.is_empty() {
            return Err(CaptureError::EmptyPath);
        }
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::InvalidArgument(format!(
                "invalid resolution {}x{}",
                self.width, self.height
            )));
        }
        if self.frame_count == 0 {
            return Err(CaptureError::InvalidArgument(
                "frame_count must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    /// Readiness wait per frame.
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
