//! Configuration file support for vibe-clock
//!
//! Configuration is stored in TOML format at:
//! - Linux: `~/.config/vibe-clock/config.toml`
//! - macOS: `~/Library/Application Support/vibe-clock/config.toml`
//! - Windows: `%APPDATA%\vibe-clock\config.toml`

use crate::connection::ConnectionSettings;
use crate::error::{Error, Result};
use crate::looper::LoopMode;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default wait between connection attempts.
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 1000;

/// Default control-rate poll interval.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 20;

/// Default capacity of the loop-wrap ring between the real-time thread and
/// the control thread.
pub const DEFAULT_WRAP_QUEUE: usize = 64;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transport server client configuration
    pub client: ClientSettings,
    /// Loop enforcement configuration
    #[serde(rename = "loop")]
    pub looping: LoopSettings,
    /// Host integration configuration
    pub host: HostSettings,
}

impl Config {
    /// Load configuration from the default config file location
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Err(Error::Config(format!("Config file not found at {:?}", path)))
        }
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return default if not found
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(config) => config,
            Err(Error::Config(_)) => Self::default(),
            Err(e) => {
                log::warn!("Ignoring unreadable config file: {}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the default config file location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = ProjectDirs::from("", "", "vibe-clock") {
            Ok(proj_dirs.config_dir().join("config.toml"))
        } else {
            Err(Error::Config("Could not determine config directory".to_string()))
        }
    }

    /// Create a default config file with comments
    pub fn create_default_config_file() -> Result<PathBuf> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, DEFAULT_CONFIG_FILE)?;
        Ok(path)
    }

    /// Reject values the bridge cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.client.client_name.trim().is_empty() {
            return Err(Error::Config("client.client_name must not be empty".to_string()));
        }
        if self.client.retry_interval_ms == 0 {
            return Err(Error::Config("client.retry_interval_ms must be positive".to_string()));
        }
        if self.looping.wrap_queue == 0 {
            return Err(Error::Config("loop.wrap_queue must be positive".to_string()));
        }
        if self.host.poll_interval_ms == 0 {
            return Err(Error::Config("host.poll_interval_ms must be positive".to_string()));
        }
        Ok(())
    }

    /// Settings for the background connection task
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            client_name: self.client.client_name.clone(),
            retry_interval: Duration::from_millis(self.client.retry_interval_ms),
            reconnect_on_shutdown: self.client.reconnect_on_shutdown,
            loop_mode: self.looping.mode,
            wrap_queue: self.looping.wrap_queue,
        }
    }

    /// How often the host polls the transport
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.host.poll_interval_ms)
    }
}

const DEFAULT_CONFIG_FILE: &str = r#"# vibe-clock configuration file
# https://github.com/trusch/vibelang

[client]
# JACK client name
client_name = "vibe-clock"

# Wait between attempts while the JACK server is not running
retry_interval_ms = 1000

# Reconnect when the JACK server shuts down
reconnect_on_shutdown = true

[loop]
# How loop-end crossings are detected:
#   "alternating"    - wrap on every other cycle spent past the loop end
#   "edge_triggered" - wrap exactly once per crossing (recommended)
mode = "alternating"

# Loop-wrap events buffered between the JACK thread and the poll loop;
# further wraps are counted as dropped until the poll loop catches up
wrap_queue = 64

[host]
# Set to true when the host's audio runs through JACK; required for freewheel
audio_via_jack = true

# Transport poll interval in milliseconds
poll_interval_ms = 20
"#;

/// Transport server client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// JACK client name
    pub client_name: String,
    /// Wait between connection attempts in milliseconds
    pub retry_interval_ms: u64,
    /// Reconnect after the server shuts down
    pub reconnect_on_shutdown: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            client_name: "vibe-clock".to_string(),
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            reconnect_on_shutdown: true,
        }
    }
}

/// Loop enforcement settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopSettings {
    /// Crossing detection mode
    pub mode: LoopMode,
    /// Capacity of the loop-wrap queue
    pub wrap_queue: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            mode: LoopMode::Alternating,
            wrap_queue: DEFAULT_WRAP_QUEUE,
        }
    }
}

/// Host integration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    /// Whether the host's audio runs through JACK
    pub audio_via_jack: bool,
    /// Poll interval in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            audio_via_jack: true,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}
