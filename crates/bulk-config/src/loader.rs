//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "bulk-sms.toml",
    "config.toml",
    "./config/bulk-sms.toml",
    "/etc/bulk-sms/config.toml",
];

const ENV_PREFIX: &str = "BULK_SMS_";

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    /// Replaces the process environment when set (tests)
    env: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_path: None,
            env: None,
        }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
            env: None,
        }
    }

    /// Read overrides from the given variables instead of the process environment.
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file()? {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);

        Ok(config)
    }

    fn var(&self, name: &str) -> Option<String> {
        let key = format!("{}{}", ENV_PREFIX, name);
        match &self.env {
            Some(vars) => vars.get(&key).cloned(),
            None => env::var(&key).ok(),
        }
    }

    fn parsed<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        let raw = self.var(name)?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(variable = %format!("{}{}", ENV_PREFIX, name), value = %raw, "Ignoring unparsable override");
                None
            }
        }
    }

    /// Find the configuration file to use.
    ///
    /// An explicitly requested file that does not exist is an error; the
    /// standard search paths are optional.
    fn find_config_file(&self) -> Result<Option<PathBuf>, ConfigError> {
        if let Some(path) = &self.config_path {
            return if path.exists() {
                Ok(Some(path.clone()))
            } else {
                Err(missing(path))
            };
        }

        if let Some(path) = self.var("CONFIG") {
            let path = PathBuf::from(path);
            return if path.exists() { Ok(Some(path)) } else { Err(missing(&path)) };
        }

        Ok(CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists()))
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // SMPP
        if let Some(val) = self.var("SMPP_ENDPOINTS") {
            config.smpp.endpoints = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(val) = self.var("SMPP_SYSTEM_ID") {
            config.smpp.system_id = val;
        }
        if let Some(val) = self.var("SMPP_PASSWORD") {
            config.smpp.password = val;
        }
        if let Some(val) = self.parsed("SMPP_ENQUIRE_LINK_SECS") {
            config.smpp.enquire_link_secs = val;
        }
        if let Some(val) = self.parsed("SMPP_CONNECT_TIMEOUT_MS") {
            config.smpp.connect_timeout_ms = val;
        }
        if let Some(val) = self.parsed("SMPP_RESPONSE_TIMEOUT_MS") {
            config.smpp.response_timeout_ms = val;
        }
        if let Some(val) = self.parsed("SMPP_DATA_CODING") {
            config.smpp.data_coding = val;
        }

        // Workers
        if let Some(val) = self.parsed("WORKERS_COUNT") {
            config.workers.count = val;
        }
        if let Some(val) = self.parsed("WORKERS_RECONNECT_BACKOFF_MS") {
            config.workers.reconnect_backoff_ms = val;
        }
        if let Some(val) = self.parsed("WORKERS_MAX_RECONNECT_ATTEMPTS") {
            config.workers.max_reconnect_attempts = val;
        }
        if let Some(val) = self.parsed("WORKERS_SHUTDOWN_TIMEOUT_MS") {
            config.workers.shutdown_timeout_ms = val;
        }
        if let Some(val) = self.parsed("WORKERS_STARTUP_TIMEOUT_MS") {
            config.workers.startup_timeout_ms = val;
        }
        if let Some(val) = self.parsed("WORKERS_MAX_SUBMITS_PER_SECOND") {
            config.workers.max_submits_per_second = val;
        }

        // Batch
        if let Some(val) = self.parsed("BATCH_SIZE") {
            config.batch.size = val;
        }
        if let Some(val) = self.parsed("BATCH_TPS") {
            config.batch.tps = val;
        }
        if let Some(val) = self.parsed("BATCH_LICENSE_TPS_CEILING") {
            config.batch.license_tps_ceiling = val;
        }
    }
}

fn missing(path: &Path) -> ConfigError {
    ConfigError::ReadError(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("config file not found: {}", path.display()),
    ))
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
