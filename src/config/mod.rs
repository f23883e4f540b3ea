//! Configuration management for mir-compositor
//!
//! This module handles loading, parsing, and validating configuration
//! from TOML files. It covers the buffer pool of each stream, the frame
//! dropping timeout, and the compositing threads.

use crate::geometry::Size;
use crate::graphics::{BufferProperties, BufferUsage, PixelFormat};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration struct containing all compositor settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct MirConfig {
    /// Buffer pool of every new stream
    #[serde(default)]
    pub buffers: BufferConfig,

    /// Timeout that unsticks clients when the compositor stops consuming
    #[serde(default)]
    pub frame_dropping: FrameDroppingConfig,

    /// Compositing thread behaviour
    #[serde(default)]
    pub compositor: CompositorConfig,

    /// Frame timing statistics
    #[serde(default)]
    pub pacing: PacingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BufferConfig {
    /// Buffers per stream (at least 2)
    pub nbuffers: usize,

    /// Let clients overwrite frames the compositor has not shown yet
    pub framedropping: bool,

    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub usage: BufferUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FrameDroppingConfig {
    /// Attach a timeout policy to every stream
    pub enabled: bool,

    /// How long a client may stay blocked before a frame is dropped (ms)
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompositorConfig {
    /// Composite once as soon as the threads start
    pub compose_on_start: bool,

    /// Fixed sleep after every pass instead of the display's recommendation (ms)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_composite_delay_ms: Option<u64>,

    /// Scan fullscreen opaque surfaces out directly
    pub bypass: bool,

    /// How long start() waits for each compositing thread (ms)
    pub start_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PacingConfig {
    /// Frame rate the per-thread statistics are measured against
    pub target_fps: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            nbuffers: 3,
            framedropping: false,
            width: 1920,
            height: 1080,
            format: PixelFormat::Argb8888,
            usage: BufferUsage::Software,
        }
    }
}

impl Default for FrameDroppingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_ms: 100,
        }
    }
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            compose_on_start: true,
            fixed_composite_delay_ms: None,
            bypass: true,
            start_timeout_ms: 10_000,
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self { target_fps: 60 }
    }
}

impl BufferConfig {
    /// Properties of the buffers a new stream allocates
    pub fn properties(&self) -> BufferProperties {
        BufferProperties::new(Size::new(self.width, self.height), self.format, self.usage)
    }
}

impl FrameDroppingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl CompositorConfig {
    pub fn fixed_composite_delay(&self) -> Option<Duration> {
        self.fixed_composite_delay_ms.map(Duration::from_millis)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }
}

impl MirConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = expand_home(path.as_ref())?;

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: MirConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.buffers.nbuffers < 2 || self.buffers.nbuffers > 16 {
            anyhow::bail!(
                "Invalid nbuffers {}: must be between 2 and 16",
                self.buffers.nbuffers
            );
        }

        if self.buffers.width == 0 || self.buffers.height == 0 {
            anyhow::bail!(
                "Invalid buffer size {}x{}: both dimensions must be non-zero",
                self.buffers.width,
                self.buffers.height
            );
        }

        if self.frame_dropping.enabled && self.frame_dropping.timeout_ms == 0 {
            anyhow::bail!("Invalid frame_dropping timeout_ms: must be greater than 0");
        }

        if self.compositor.start_timeout_ms == 0 {
            anyhow::bail!("Invalid start_timeout_ms: must be greater than 0");
        }

        if self.pacing.target_fps == 0 || self.pacing.target_fps > 1000 {
            anyhow::bail!("Invalid target_fps: must be between 1 and 1000");
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }
}

/// Expands a leading `~` to the home directory
fn expand_home(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            Ok(Path::new(&home).join(rest))
        }
        Err(_) => Ok(path.to_path_buf()),
    }
}
