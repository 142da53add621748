use std::path::Path;
use thiserror::Error;

use super::types::SyncConfigFile;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

/// Load sync configuration from a JSON file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<SyncConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: SyncConfigFile = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a JSON string
pub fn load_config_from_str(json: &str) -> Result<SyncConfigFile, ConfigError> {
    let config: SyncConfigFile = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
}

/// Load the default embedded configuration
pub fn load_default_config() -> Result<SyncConfigFile, ConfigError> {
    let default_config = include_str!("sync_config.json");
    load_config_from_str(default_config)
}

impl SyncConfigFile {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.max_connections == 0 {
            return Err(ConfigError::InvalidValue(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.sync.ping_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "ping_interval_ms must be positive".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue(
                "retry.backoff_multiplier must be >= 1.0".into(),
            ));
        }
        Ok(())
    }
}
