//! Configuration system for the glaze broker
//!
//! Loads configuration from TOML file at `~/.config/glaze/config.toml`
//! Auto-generates default config file on first run if missing.

use anyhow::{bail, Context, Result};
use glaze_proto::handshake::HandshakeRecord;
use glaze_proto::TransportMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub surface: SurfaceConfig,
    pub table: TableConfig,
    pub shared_memory: SharedMemoryConfig,
    pub launcher: LauncherConfig,
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            // Auto-generate default config file
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path (`--config <path>`)
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        info!("Configuration loaded from {:?}", path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.table.page_size == 0 {
            bail!("table.page_size must be at least 1");
        }
        if self.surface.width == 0 || self.surface.height == 0 {
            bail!(
                "surface dimensions must be non-zero, got {}x{}",
                self.surface.width,
                self.surface.height
            );
        }
        let smallest = SharedMemoryConfig::minimum_parameter_capacity();
        if self.shared_memory.parameter_capacity < smallest {
            bail!(
                "shared_memory.parameter_capacity must be at least {} bytes, got {}",
                smallest,
                self.shared_memory.parameter_capacity
            );
        }
        Ok(())
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("glaze");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_string =
            toml::to_string_pretty(&Self::default()).context("Failed to serialize default config")?;

        fs::write(path, toml_string).context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }
}

/// Serving loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// "socket" or "shared_memory"
    pub transport: TransportMode,
    /// Listening socket; defaults to `$XDG_RUNTIME_DIR/glaze.sock`
    pub socket_path: Option<PathBuf>,
    /// Longest a serving-loop iteration waits for work, in milliseconds
    pub poll_interval_ms: u64,
    /// Read/write timeout on accepted connections, in milliseconds
    pub io_timeout_ms: u64,
    /// Log every texture transfer at debug level
    pub log_transfers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportMode::Socket,
            socket_path: None,
            poll_interval_ms: 16,
            io_timeout_ms: 1000,
            log_transfers: false,
        }
    }
}

impl ServerConfig {
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(glaze_proto::socket_path)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms.max(1))
    }
}

/// Headless surface dimensions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// Object table configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    /// Slots per page
    pub page_size: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self { page_size: 64 }
    }
}

/// Shared-memory transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedMemoryConfig {
    /// Payload capacity of the parameters segment, in bytes
    pub parameter_capacity: usize,
}

impl Default for SharedMemoryConfig {
    fn default() -> Self {
        Self {
            parameter_capacity: 4096,
        }
    }
}

impl SharedMemoryConfig {
    /// The largest fixed-size message is the handshake reply
    pub fn minimum_parameter_capacity() -> usize {
        8 + HandshakeRecord::size()
    }
}

/// Client processes launched once the server is up
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub clients: Vec<PathBuf>,
}
