//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{DEFAULT_CONTROL_PORT, DEFAULT_FORWARD_PORT};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Forwarder configuration
    pub forwarder: Option<ForwarderConfig>,
    /// Controller configuration
    pub controller: Option<ControllerConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Forwarder-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    /// Address to listen on for controller connections
    pub control_listen: String,
    /// Address to listen on for real clients once a controller attaches
    pub forward_listen: String,
    /// Shared token controllers must present
    pub auth_token: String,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            control_listen: format!("0.0.0.0:{}", DEFAULT_CONTROL_PORT),
            forward_listen: format!("0.0.0.0:{}", DEFAULT_FORWARD_PORT),
            auth_token: String::new(),
        }
    }
}

/// Controller-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Forwarder control address to connect to
    pub control_addr: String,
    /// Shared token presented during authentication
    pub auth_token: String,
    /// Local upstream each tunneled connection is bridged to
    pub upstream: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            control_addr: format!("127.0.0.1:{}", DEFAULT_CONTROL_PORT),
            auth_token: String::new(),
            upstream: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        forwarder: Some(ForwarderConfig::default()),
        controller: Some(ControllerConfig::default()),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_roundtrips_through_toml() {
        let config = generate_example_config();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();

        let forwarder = parsed.forwarder.unwrap();
        assert_eq!(forwarder.control_listen, "0.0.0.0:12345");
        assert_eq!(forwarder.forward_listen, "0.0.0.0:4782");
    }

    #[test]
    fn test_minimal_config() {
        let parsed: Config = toml::from_str(
            r#"
            [controller]
            control_addr = "203.0.113.9:12345"
            auth_token = "keep-the-secret"
            upstream = "127.0.0.1:9000"
            "#,
        )
        .unwrap();

        assert!(parsed.forwarder.is_none());
        assert_eq!(parsed.logging.level, "info");
        assert_eq!(parsed.controller.unwrap().auth_token, "keep-the-secret");
    }
}
