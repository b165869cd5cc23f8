//! Configuration loading using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/motionlink.toml` unless given explicitly)
//! 2. environment variables prefixed with `MOTIONLINK_`, with `__`
//!    separating nested keys
//!
//! # Example
//! ```no_run
//! use motionlink::config::LinkConfig;
//!
//! let config = LinkConfig::load()?;
//! config.validate()?;
//! for device in config.enabled_devices() {
//!     println!("{} ({})", device.id, device.driver);
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{bail, ensure, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use link_drivers::DriverContext;
use link_protocol::{EngineConfig, MotionConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/motionlink.toml";

/// Log levels accepted by `application.log_level`.
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Formats accepted by `application.log_format`.
pub const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub motion: MotionSettings,
    /// Device definitions
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Command/response engine timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Budget for a command round trip when the caller gives none
    #[serde(default = "default_command_timeout")]
    pub default_timeout_ms: u64,
    /// Quiet period that ends a purge of stale input
    #[serde(default = "default_purge_window")]
    pub purge_window_ms: u64,
    /// Pause between reads when nothing has arrived
    #[serde(default = "default_read_poll")]
    pub read_poll_ms: u64,
    /// Grace period for a partially received frame
    #[serde(default = "default_frame_timeout")]
    pub frame_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_command_timeout(),
            purge_window_ms: default_purge_window(),
            read_poll_ms: default_read_poll(),
            frame_timeout_ms: default_frame_timeout(),
        }
    }
}

/// Motion coordinator timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionSettings {
    /// Pause between status polls, and the length of one completion wait step
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Budget for position and status queries
    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,
    /// Budget for a whole motion
    #[serde(default = "default_motion_timeout")]
    pub default_timeout_ms: u64,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            query_timeout_ms: default_query_timeout(),
            default_timeout_ms: default_motion_timeout(),
        }
    }
}

/// Device definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device identifier
    pub id: String,
    /// Driver type (e.g., "apt", "zaber", "lambda", "lambda_wheel")
    pub driver: String,
    /// Whether this device is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Driver-specific configuration, parsed by the driver factory
    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_command_timeout() -> u64 {
    500
}

fn default_purge_window() -> u64 {
    5
}

fn default_read_poll() -> u64 {
    2
}

fn default_frame_timeout() -> u64 {
    50
}

fn default_poll_interval() -> u64 {
    50
}

fn default_query_timeout() -> u64 {
    500
}

fn default_motion_timeout() -> u64 {
    10_000
}

fn default_enabled() -> bool {
    true
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl LinkConfig {
    /// Load configuration from the default path and environment variables
    ///
    /// Environment variables override the file, e.g.
    /// `MOTIONLINK_APPLICATION__LOG_LEVEL=debug`.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    /// The provider stack behind [`load_from`](Self::load_from).
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("MOTIONLINK_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<()> {
        let level = self.application.log_level.to_lowercase();
        ensure!(
            LOG_LEVELS.contains(&level.as_str()),
            "Invalid log_level '{}'. Must be one of: {}",
            self.application.log_level,
            LOG_LEVELS.join(", ")
        );

        let format = self.application.log_format.to_lowercase();
        ensure!(
            LOG_FORMATS.contains(&format.as_str()),
            "Invalid log_format '{}'. Must be one of: {}",
            self.application.log_format,
            LOG_FORMATS.join(", ")
        );

        for (name, value) in [
            ("engine.default_timeout_ms", self.engine.default_timeout_ms),
            ("engine.read_poll_ms", self.engine.read_poll_ms),
            ("engine.frame_timeout_ms", self.engine.frame_timeout_ms),
            ("motion.poll_interval_ms", self.motion.poll_interval_ms),
            ("motion.query_timeout_ms", self.motion.query_timeout_ms),
            ("motion.default_timeout_ms", self.motion.default_timeout_ms),
        ] {
            ensure!(value > 0, "{} must be positive", name);
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                bail!("Device with driver '{}' has an empty id", device.driver);
            }
            if !ids.insert(device.id.as_str()) {
                bail!("Duplicate device ID: {}", device.id);
            }
            ensure!(
                device.config.is_table(),
                "Device '{}': config must be a table",
                device.id
            );
        }

        Ok(())
    }

    /// Get all enabled devices
    pub fn enabled_devices(&self) -> Vec<&DeviceDefinition> {
        self.devices.iter().filter(|device| device.enabled).collect()
    }

    /// Look up a device by id, enabled or not.
    pub fn device(&self, id: &str) -> Option<&DeviceDefinition> {
        self.devices.iter().find(|device| device.id == id)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            default_timeout: Duration::from_millis(self.engine.default_timeout_ms),
            read_poll: Duration::from_millis(self.engine.read_poll_ms),
            frame_timeout: Duration::from_millis(self.engine.frame_timeout_ms),
            ..EngineConfig::default()
        }
    }

    pub fn motion_config(&self) -> MotionConfig {
        MotionConfig {
            poll_interval: Duration::from_millis(self.motion.poll_interval_ms),
            query_timeout: Duration::from_millis(self.motion.query_timeout_ms),
        }
    }

    /// Budget for a whole motion started from the command line.
    pub fn motion_timeout(&self) -> Duration {
        Duration::from_millis(self.motion.default_timeout_ms)
    }

    /// Everything a driver factory needs besides its own table.
    pub fn driver_context(&self) -> DriverContext {
        DriverContext {
            engine: self.engine_config(),
            motion: self.motion_config(),
            purge_window: Duration::from_millis(self.engine.purge_window_ms),
            operation_timeout: self.motion_timeout(),
        }
    }
}
