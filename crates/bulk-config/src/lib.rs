//! Bulk SMS Configuration System
//!
//! TOML-based configuration with environment variable override support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub smpp: SmppConfig,
    pub workers: WorkersConfig,
    pub batch: BatchConfig,
}

/// SMPP session configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmppConfig {
    /// Remote endpoints as `host:port`; workers are assigned round-robin
    pub endpoints: Vec<String>,
    pub system_id: String,
    pub password: String,
    /// Keep-alive period for enquire_link
    pub enquire_link_secs: u64,
    pub connect_timeout_ms: u64,
    /// How long a submit_sm waits for its response
    pub response_timeout_ms: u64,
    pub source_addr_ton: u8,
    pub source_addr_npi: u8,
    pub dest_addr_ton: u8,
    pub dest_addr_npi: u8,
    /// 8 = UCS-2, 0 = SMSC default alphabet
    pub data_coding: u8,
}

impl Default for SmppConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2775".to_string()],
            system_id: String::new(),
            password: String::new(),
            enquire_link_secs: 10,
            connect_timeout_ms: 10_000,
            response_timeout_ms: 10_000,
            source_addr_ton: 5,
            source_addr_npi: 0,
            dest_addr_ton: 5,
            dest_addr_npi: 0,
            data_coding: 8,
        }
    }
}

impl std::fmt::Debug for SmppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmppConfig")
            .field("endpoints", &self.endpoints)
            .field("system_id", &self.system_id)
            .field("password", &"***")
            .field("enquire_link_secs", &self.enquire_link_secs)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("response_timeout_ms", &self.response_timeout_ms)
            .field("data_coding", &self.data_coding)
            .finish_non_exhaustive()
    }
}

impl SmppConfig {
    pub fn enquire_link_interval(&self) -> Duration {
        Duration::from_secs(self.enquire_link_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Session worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Number of parallel SMPP sessions
    pub count: usize,
    /// Delay before re-establishing a dropped session
    pub reconnect_backoff_ms: u64,
    /// Consecutive failed reconnects before a worker reports an error
    pub max_reconnect_attempts: u32,
    /// Per-worker graceful close wait before force termination
    pub shutdown_timeout_ms: u64,
    /// Upper bound on the initial bind of the whole pool
    pub startup_timeout_ms: u64,
    /// Capacity of each worker's command channel
    pub command_buffer: usize,
    /// Per-session submit_sm rate limit (0 = unlimited)
    pub max_submits_per_second: u32,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: 14,
            reconnect_backoff_ms: 5_000,
            max_reconnect_attempts: 10,
            shutdown_timeout_ms: 5_000,
            startup_timeout_ms: 30_000,
            command_buffer: 1024,
            max_submits_per_second: 0,
        }
    }
}

/// Batch pacing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Destinations per dispatch tick
    pub size: usize,
    /// Target messages per second (0 = derive from license ceiling and peak usage)
    pub tps: u32,
    /// Licensed throughput of the SMSC account
    pub license_tps_ceiling: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: 14,
            tps: 0,
            license_tps_ceiling: 5_000,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Check the settings a run cannot start without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.count == 0 {
            return Err(ConfigError::ValidationError(
                "workers.count must be at least 1".to_string(),
            ));
        }
        if self.batch.size == 0 {
            return Err(ConfigError::ValidationError(
                "batch.size must be at least 1".to_string(),
            ));
        }
        if self.smpp.endpoints.is_empty() {
            return Err(ConfigError::ValidationError(
                "smpp.endpoints must list at least one host:port".to_string(),
            ));
        }
        for endpoint in &self.smpp.endpoints {
            validate_endpoint(endpoint)?;
        }
        if self.smpp.system_id.is_empty() {
            return Err(ConfigError::ValidationError(
                "smpp.system_id is required".to_string(),
            ));
        }
        if self.workers.command_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "workers.command_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Bulk SMS Configuration
# Environment variables (BULK_SMS_*) override these settings

[smpp]
endpoints = ["10.10.52.18:5001", "10.10.52.19:5001"]
system_id = "lbtest"
password = "changeme"
enquire_link_secs = 10
connect_timeout_ms = 10000
response_timeout_ms = 10000
source_addr_ton = 5
source_addr_npi = 0
dest_addr_ton = 5
dest_addr_npi = 0
data_coding = 8  # 8 = UCS-2, 0 = default alphabet

[workers]
count = 14
reconnect_backoff_ms = 5000
max_reconnect_attempts = 10
shutdown_timeout_ms = 5000
startup_timeout_ms = 30000
command_buffer = 1024
max_submits_per_second = 0  # 0 = unlimited

[batch]
size = 14
tps = 0  # 0 = license ceiling minus peak usage
license_tps_ceiling = 5000
"#
        .to_string()
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::ValidationError(format!("invalid endpoint '{}', expected host:port", endpoint));

    let (host, port) = endpoint.rsplit_once(':').ok_or_else(invalid)?;
    if host.trim().is_empty() {
        return Err(invalid());
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid()),
        Ok(_) => Ok(()),
    }
}
