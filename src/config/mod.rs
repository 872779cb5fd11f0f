//! # Configuration
//!
//! TOML configuration for the gateway binary, with defaults for every key.
//!
//! ## Sections
//!
//! - [`MeshtasticConfig`] - serial device settings
//! - [`GatewayConfig`] - ack timing, ingestion queue, dedup window, send limits
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshgate::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     println!("Serial Port: {}", config.meshtastic.port);
//!
//!     Config::create_default("config.toml").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## File Format
//!
//! ```toml
//! [meshtastic]
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//! channel = 0
//!
//! [gateway]
//! ack_timeout_secs = 30
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Missing sections and keys fall back to [`Config::default`].

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub meshtastic: MeshtasticConfig,
    pub gateway: GatewayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshtasticConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Channel index used for outbound text when none is given.
    pub channel: u32,
    /// How long to wait for the device's configuration dump after opening the port.
    pub connect_timeout_secs: u64,
    /// Interval between keep-alive heartbeats to the device (0 disables).
    pub heartbeat_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Per-message ack wait.
    pub ack_timeout_secs: u64,
    /// How often pending acks are checked against their deadlines.
    pub ack_sweep_interval_ms: u64,
    /// Capacity of the device → dispatcher event channel.
    pub ingest_queue_depth: usize,
    /// Number of recent `(from, id)` pairs remembered for duplicate suppression (0 disables).
    pub dedup_window: usize,
    /// Largest outbound text accepted, in UTF-8 bytes.
    pub max_text_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for MeshtasticConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
            channel: 0,
            connect_timeout_secs: 60,
            heartbeat_secs: 30,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ack_timeout_secs: 30,
            ack_sweep_interval_ms: 1000,
            ingest_queue_depth: 256,
            dedup_window: 512,
            // Leaves room for Meshtastic protocol overhead in a ~230 byte frame
            max_text_bytes: 200,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshgate.log".to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            meshtastic: MeshtasticConfig::default(),
            gateway: GatewayConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;
        config.validate()?;

        Ok(config)
    }

    /// Write a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.meshtastic.port.trim().is_empty() {
            bail!("meshtastic.port must not be empty");
        }
        if self.meshtastic.baud_rate == 0 {
            bail!("meshtastic.baud_rate must be positive");
        }
        if self.meshtastic.connect_timeout_secs == 0 {
            bail!("meshtastic.connect_timeout_secs must be positive");
        }
        let gw = &self.gateway;
        if gw.ack_timeout_secs == 0 {
            bail!("gateway.ack_timeout_secs must be positive");
        }
        if !(50..=10_000).contains(&gw.ack_sweep_interval_ms) {
            bail!(
                "gateway.ack_sweep_interval_ms must be between 50 and 10000 (got {})",
                gw.ack_sweep_interval_ms
            );
        }
        if gw.ingest_queue_depth == 0 {
            bail!("gateway.ingest_queue_depth must be positive");
        }
        if gw.max_text_bytes == 0 {
            bail!("gateway.max_text_bytes must be positive");
        }
        if log_level(&self.logging.level).is_none() {
            bail!("logging.level '{}' is not a log level", self.logging.level);
        }
        Ok(())
    }
}

/// Parse a configured level name.
pub fn log_level(name: &str) -> Option<log::LevelFilter> {
    match name.trim().to_ascii_lowercase().as_str() {
        "off" => Some(log::LevelFilter::Off),
        "error" => Some(log::LevelFilter::Error),
        "warn" | "warning" => Some(log::LevelFilter::Warn),
        "info" => Some(log::LevelFilter::Info),
        "debug" => Some(log::LevelFilter::Debug),
        "trace" => Some(log::LevelFilter::Trace),
        _ => None,
    }
}
