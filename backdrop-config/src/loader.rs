//! Configuration loading and environment variable handling

use crate::domains::logging::{LogFormat, LogLevel, LoggingConfig};
use crate::domains::utils::parse_millis;
use crate::domains::workers::WorkerConfig;
use crate::domains::BackdropConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "BACKDROP".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<BackdropConfig> {
        let content = std::fs::read_to_string(path)?;
        let mut config: BackdropConfig = serde_yaml::from_str(&content)?;

        // Apply environment variable overrides
        self.apply_env_overrides(&mut config)?;

        // Validate all domains
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<BackdropConfig> {
        let mut config = BackdropConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<BackdropConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut BackdropConfig) -> ConfigResult<()> {
        self.apply_worker_overrides(&mut config.workers)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply worker config overrides
    fn apply_worker_overrides(&self, config: &mut WorkerConfig) -> ConfigResult<()> {
        if let Ok(max_workers) = self.get_env_var("MAX_WORKERS") {
            config.max_workers = max_workers
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid MAX_WORKERS: {}", e)))?;
        }

        if let Ok(capacity) = self.get_env_var("CHANNEL_CAPACITY") {
            config.default_channel_capacity = capacity
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid CHANNEL_CAPACITY: {}", e)))?;
        }

        if let Ok(timeout) = self.get_env_var("WAIT_TIMEOUT_MS") {
            let timeout = parse_millis(&timeout)
                .map_err(|e| ConfigError::EnvError(format!("Invalid WAIT_TIMEOUT_MS: {}", e)))?;
            config.default_wait_timeout = Some(timeout);
        }

        if let Ok(grace) = self.get_env_var("CANCEL_GRACE_MS") {
            config.cancel_grace_period = parse_millis(&grace)
                .map_err(|e| ConfigError::EnvError(format!("Invalid CANCEL_GRACE_MS: {}", e)))?;
        }

        if let Ok(program) = self.get_env_var("WORKER_PROGRAM") {
            config.program = Some(PathBuf::from(program));
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(&self, config: &mut LoggingConfig) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
