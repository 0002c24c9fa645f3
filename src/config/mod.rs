//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Agent configuration
    #[serde(default)]
    pub agent: AgentConfig,
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

    /// Check that required fields are present
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.agent.orchestrator.is_empty() {
            return Err(crate::Error::Config(
                "No orchestrator address configured".to_string(),
            ));
        }
        Ok(())
    }
}

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Orchestrator address (`host:port`)
    #[serde(default)]
    pub orchestrator: String,
    /// Identity string announced at registration
    #[serde(default = "default_identity")]
    pub identity: String,
    /// Reconnect to the orchestrator after the session drops
    #[serde(default)]
    pub reconnect: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            orchestrator: String::new(),
            identity: default_identity(),
            reconnect: false,
        }
    }
}

fn default_identity() -> String {
    crate::DEFAULT_IDENTITY.to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            [agent]
            orchestrator = "203.0.113.7:7000"
            identity = "edge-agent"
            reconnect = true

            [logging]
            level = "debug"
            format = "compact"
            "#,
        )
        .unwrap();

        assert_eq!(config.agent.orchestrator, "203.0.113.7:7000");
        assert_eq!(config.agent.identity, "edge-agent");
        assert!(config.agent.reconnect);
        assert_eq!(config.logging.level, "debug");
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str(
            r#"
            [agent]
            orchestrator = "127.0.0.1:7000"
            "#,
        )
        .unwrap();

        assert_eq!(config.agent.identity, crate::DEFAULT_IDENTITY);
        assert!(!config.agent.reconnect);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_requires_orchestrator() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }
}
