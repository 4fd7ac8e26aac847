//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `bridge.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - RepositoryConfig: Mobius base url and oneM2M release version.
//!     - PublisherConfig: DATA container identity, upload cadence, sensor pin.
//!     - PollerConfig: CMD container identity, poll cadence, actuator pin.
//!     - LoggingConfig: default log level.
//!
//! every field has a default, so a partial file is valid.
//!
//! ==============================================================================

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::ContainerPath;

/// which loop this process runs
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default, clap::Subcommand)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// sample the sensor and upload readings
    #[default]
    Publisher,
    /// poll the command container and drive the actuator
    Poller,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Publisher => f.write_str("publisher"),
            Role::Poller => f.write_str("poller"),
        }
    }
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct BridgeConfig {
    pub role: Role,
    pub repository: RepositoryConfig,
    pub publisher: PublisherConfig,
    pub poller: PollerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RepositoryConfig {
    pub base_url: String,
    /// sent as X-M2M-RVI
    pub release_version: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PublisherConfig {
    pub application_entity: String,
    pub container: String,
    pub originator: String,
    pub upload_interval_seconds: u64,
    pub retry_delay_ms: u64,
    pub request_timeout_seconds: u64,
    pub sensor: SensorConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SensorModel {
    Dht11,
    Dht22,
    Mock,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SensorConfig {
    pub model: SensorModel,
    pub gpio_pin: u8,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PollerConfig {
    pub application_entity: String,
    pub container: String,
    pub originator: String,
    pub poll_interval_ms: u64,
    pub request_timeout_seconds: u64,
    /// key inside the command mapping that carries on/off
    pub command_field: String,
    pub actuator: ActuatorConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ActuatorConfig {
    pub gpio_pin: u8,
    /// relay boards that switch on a LOW input
    pub active_low: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl PublisherConfig {
    pub fn container_path(&self) -> ContainerPath {
        ContainerPath::new(&self.application_entity, &self.container)
    }

    pub fn upload_interval(&self) -> Duration {
        Duration::from_secs(self.upload_interval_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl PollerConfig {
    pub fn container_path(&self) -> ContainerPath {
        ContainerPath::new(&self.application_entity, &self.container)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl BridgeConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        Self::parse(&content).with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load with default fallback
    pub fn load_or_default() -> Self {
        let paths = [
            PathBuf::from("config").join("bridge.toml"),
            PathBuf::from("..").join("config").join("bridge.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: Failed to load {}: {:#}", path.display(), e);
                    }
                }
            }
        }

        println!("[CONFIG] Warning: No config file found - using defaults");
        Self::default()
    }

    /// Print configuration summary
    pub fn print_summary(&self, role: Role) {
        let (path, cadence) = match role {
            Role::Publisher => (
                self.publisher.container_path(),
                format!("{}s", self.publisher.upload_interval_seconds),
            ),
            Role::Poller => (
                self.poller.container_path(),
                format!("{}ms", self.poller.poll_interval_ms),
            ),
        };
        println!("┌─────────────────────────────────────────┐");
        println!("│          BRIDGE CONFIGURATION           │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Role: {}", role);
        println!("│ Repository: {}", self.repository.base_url);
        println!("│ Container: {}", path);
        println!("│ Cadence: {}", cadence);
        println!("│ Log Level: {}", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:7599/Mobius".to_string(),
            release_version: "4".to_string(),
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            application_entity: "DHT_AE".to_string(),
            container: "DATA".to_string(),
            originator: "SM".to_string(),
            upload_interval_seconds: 5,
            retry_delay_ms: 200,
            request_timeout_seconds: 5,
            sensor: SensorConfig::default(),
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self { model: SensorModel::Dht11, gpio_pin: 8 }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            application_entity: "FAN_AE".to_string(),
            container: "CMD".to_string(),
            originator: "SM2".to_string(),
            poll_interval_ms: 500,
            request_timeout_seconds: 3,
            command_field: "fan".to_string(),
            actuator: ActuatorConfig::default(),
        }
    }
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self { gpio_pin: 18, active_low: false }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: true }
    }
}
