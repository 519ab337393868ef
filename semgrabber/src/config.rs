/*!
Configuration management for the acquisition application.
*/

use serde::{Deserialize, Serialize};
use shared::{CapturedChannels, SessionGeometry, SessionStrategy, SlotPolicy};
use std::path::Path;
use std::time::Duration;
use anyhow::{bail, Context, Result};

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub acquisition: AcquisitionConfig,
    pub transport: TransportConfig,
    pub output: OutputConfig,
}

impl AppConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self {
            acquisition: AcquisitionConfig::default(),
            transport: TransportConfig::default(),
            output: OutputConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load_from_file(path)
        } else {
            Ok(Self::new())
        }
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Pixel strategy names as written in the config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Buffered,
    Preview,
}

/// Scan geometry and image assembly settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Number of interleaved channels per line
    pub channel_count: usize,

    /// Physical channel captured in each slot, in interleave order
    pub captured_channels: Vec<u8>,

    /// Samples per channel per line
    pub width: usize,

    /// Declared number of lines per frame
    pub height: usize,

    /// Buffer whole frames or render lines as they arrive
    pub strategy: StrategyKind,

    /// Detector floor subtracted by the preview strategy
    pub preview_floor: u16,

    /// What to do with lines tagged with an uncaptured channel
    pub slot_policy: SlotPolicy,

    /// How long the worker waits for a message before checking the running flag
    pub poll_interval_ms: u64,

    /// Restarts attempted after an aborted run before giving up
    pub max_restarts: u32,

    /// Pause before each restart
    pub restart_delay_ms: u64,
}

impl AcquisitionConfig {
    /// Validate the channel layout and build the session geometry
    pub fn geometry(&self) -> Result<SessionGeometry> {
        if self.captured_channels.len() != self.channel_count {
            bail!(
                "channel_count is {} but {} captured channels are listed",
                self.channel_count,
                self.captured_channels.len()
            );
        }
        let channels = CapturedChannels::new(self.captured_channels.clone())?;
        Ok(SessionGeometry::new(channels, self.width, self.height)?)
    }

    pub fn strategy(&self) -> SessionStrategy {
        match self.strategy {
            StrategyKind::Buffered => SessionStrategy::Buffered,
            StrategyKind::Preview => SessionStrategy::LivePreview { floor: self.preview_floor },
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            channel_count: 2,
            captured_channels: vec![0, 1],
            width: 512,
            height: 384,
            strategy: StrategyKind::Buffered,
            preview_floor: 0,
            slot_policy: SlotPolicy::default(),
            poll_interval_ms: 100,
            max_restarts: 5,
            restart_delay_ms: 1000,
        }
    }
}

/// UDP bridge settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// UDP bind address
    pub udp_bind_addr: String,

    /// UDP port to listen on
    pub udp_port: u16,

    /// Socket receive buffer size
    pub recv_buffer_bytes: usize,

    /// Datagrams queued between the socket thread and the worker
    pub channel_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            udp_bind_addr: "0.0.0.0".to_string(),
            udp_port: 12345,
            recv_buffer_bytes: 1024 * 1024,
            channel_buffer_size: 10000,
        }
    }
}

/// Where and how finished images are written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Root directory; every run gets a timestamped subdirectory
    pub output_directory: String,

    /// Persist every channel image of every frame
    pub save_images: bool,

    /// Combine consecutive frames into stereo pairs
    pub stereo_pairs: bool,

    /// Completed sessions kept in memory (dehydrated when saved)
    pub history_len: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_directory: "./images".to_string(),
            save_images: true,
            stereo_pairs: false,
            history_len: 16,
        }
    }
}
