//! Configuration management module.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Validation failed: {0}")]
    Validation(String),
}

/// ZKTeco device connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device IP address.
    pub ip: String,
    /// Device ZK protocol port (default: 4370).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-command timeout in milliseconds (default: 10000).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Local UDP bind port for the UDP fallback transport (default: 5200).
    #[serde(default = "default_inport")]
    pub inport: u16,
}

fn default_port() -> u16 {
    4370
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_inport() -> u16 {
    5200
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            ip: "192.168.1.201".to_string(),
            port: default_port(),
            timeout_ms: default_timeout_ms(),
            inport: default_inport(),
        }
    }
}

impl DeviceConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ip.trim().is_empty() {
            return Err(ConfigError::Validation("Device IP cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::Validation(
                "Device port must be greater than 0".to_string(),
            ));
        }
        if self.timeout_ms < 100 {
            return Err(ConfigError::Validation(
                "Timeout must be at least 100 milliseconds".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = DeviceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 4370);
        assert_eq!(config.inport, 5200);
    }

    #[test]
    fn test_validation_empty_ip() {
        let config = DeviceConfig {
            ip: String::new(),
            ..DeviceConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_short_timeout() {
        let config = DeviceConfig {
            timeout_ms: 10,
            ..DeviceConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_applies_defaults() {
        let config: DeviceConfig = toml::from_str("ip = \"10.0.0.5\"").unwrap();
        assert_eq!(config.ip, "10.0.0.5");
        assert_eq!(config.port, 4370);
        assert_eq!(config.timeout_ms, 10_000);
        assert_eq!(config.inport, 5200);
    }
}
