//! Configuration for Bastion enhancements
//!
//! Handles loading and validating the options of an enhanced client.

use std::path::Path;

use anyhow::{Context, Result};
use bastion_core::utils::logging::LogLevel;
use bastion_core::TransactionOptions;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

/// Errors that can occur in configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unsupported configuration format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// An enhancement layer that can be stacked on a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnhancementKind {
    /// Row-level access policies
    Policy,
    /// Table-per-type model hierarchies
    Delegate,
}

impl fmt::Display for EnhancementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnhancementKind::Policy => f.write_str("policy"),
            EnhancementKind::Delegate => f.write_str("delegate"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level, used when `RUST_LOG` is not set
    #[serde(default)]
    pub level: LogLevel,

    /// Whether to color the output
    #[serde(default = "default_ansi")]
    pub ansi: bool,
}

fn default_ansi() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            ansi: default_ansi(),
        }
    }
}

/// Configuration of an enhanced client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancementConfig {
    /// Enabled enhancements
    #[serde(default = "default_kinds")]
    pub kinds: Vec<EnhancementKind>,

    /// Options of the transactions the layers open
    #[serde(default)]
    pub transaction: TransactionOptions,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Whether each layer logs the queries it sends below
    #[serde(default)]
    pub log_queries: bool,
}

fn default_kinds() -> Vec<EnhancementKind> {
    vec![EnhancementKind::Policy, EnhancementKind::Delegate]
}

impl Default for EnhancementConfig {
    fn default() -> Self {
        Self {
            kinds: default_kinds(),
            transaction: TransactionOptions::default(),
            logging: LoggingConfig::default(),
            log_queries: false,
        }
    }
}

impl EnhancementConfig {
    /// Load configuration from a JSON or TOML file
    pub async fn load(path: Option<&str>) -> Result<Self> {
        let mut config = EnhancementConfig::default();

        if let Some(path) = path {
            info!("Loading configuration from {}", path);

            if !Path::new(path).exists() {
                warn!("Configuration file not found: {}", path);
                return Ok(config);
            }

            let content = fs::read_to_string(path)
                .await
                .context(format!("Failed to read configuration file: {}", path))?;

            let extension = Path::new(path)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("json")
                .to_lowercase();
            config = match extension.as_str() {
                "toml" => toml::from_str(&content)
                    .context(format!("Failed to parse configuration file: {}", path))?,
                "json" => serde_json::from_str(&content)
                    .context(format!("Failed to parse configuration file: {}", path))?,
                other => return Err(ConfigError::UnsupportedFormat(other.to_string()).into()),
            };
        } else {
            info!("No configuration file specified, using defaults");
        }

        config.validate()?;

        Ok(config)
    }

    /// Whether an enhancement is enabled
    pub fn enables(&self, kind: EnhancementKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (i, kind) in self.kinds.iter().enumerate() {
            if self.kinds[..i].contains(kind) {
                return Err(ConfigError::Invalid(format!("Enhancement {} is listed twice", kind)).into());
            }
        }

        if self.transaction.timeout_ms == Some(0) {
            return Err(ConfigError::Invalid("Transaction timeout cannot be zero".to_string()).into());
        }
        if self.transaction.max_wait_ms == Some(0) {
            return Err(ConfigError::Invalid("Transaction max wait cannot be zero".to_string()).into());
        }
        if let (Some(timeout), Some(max_wait)) = (self.transaction.timeout_ms, self.transaction.max_wait_ms) {
            if max_wait > timeout {
                warn!(
                    "Transaction max wait ({} ms) exceeds its timeout ({} ms)",
                    max_wait, timeout
                );
            }
        }

        if self.kinds.is_empty() {
            warn!("No enhancement is enabled, clients will pass calls through unchanged");
        }

        Ok(())
    }

    /// Merge with another configuration
    pub fn merge(&mut self, other: EnhancementConfig) {
        if !other.kinds.is_empty() {
            self.kinds = other.kinds;
        }

        if other.transaction.isolation_level.is_some() {
            self.transaction.isolation_level = other.transaction.isolation_level;
        }
        if other.transaction.max_wait_ms.is_some() {
            self.transaction.max_wait_ms = other.transaction.max_wait_ms;
        }
        if other.transaction.timeout_ms.is_some() {
            self.transaction.timeout_ms = other.transaction.timeout_ms;
        }

        if other.logging != LoggingConfig::default() {
            self.logging = other.logging;
        }

        if other.log_queries {
            self.log_queries = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::types::IsolationLevel;
    use tempfile::{Builder, NamedTempFile};

    #[tokio::test]
    async fn test_load_json_config() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();

        let config_json = r#"
        {
            "kinds": ["policy"],
            "transaction": { "isolationLevel": "Serializable", "timeoutMs": 5000 },
            "logging": { "level": "debug" },
            "log_queries": true
        }
        "#;
        fs::write(path, config_json).await.unwrap();

        let config = EnhancementConfig::load(Some(path)).await.unwrap();

        assert_eq!(config.kinds, vec![EnhancementKind::Policy]);
        assert!(!config.enables(EnhancementKind::Delegate));
        assert_eq!(config.transaction.isolation_level, Some(IsolationLevel::Serializable));
        assert_eq!(config.transaction.timeout_ms, Some(5000));
        assert_eq!(config.transaction.max_wait_ms, None);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert!(config.logging.ansi);
        assert!(config.log_queries);
    }

    #[tokio::test]
    async fn test_load_toml_config() {
        let file = Builder::new().suffix(".toml").tempfile().unwrap();
        let path = file.path().to_str().unwrap();

        let config_toml = r#"
kinds = ["delegate"]
log_queries = false

[transaction]
maxWaitMs = 200

[logging]
level = "warning"
ansi = false
"#;
        fs::write(path, config_toml).await.unwrap();

        let config = EnhancementConfig::load(Some(path)).await.unwrap();

        assert_eq!(config.kinds, vec![EnhancementKind::Delegate]);
        assert_eq!(config.transaction.max_wait_ms, Some(200));
        assert_eq!(config.logging.level, LogLevel::Warn);
        assert!(!config.logging.ansi);
    }

    #[tokio::test]
    async fn test_default_config() {
        let config = EnhancementConfig::load(None).await.unwrap();
        assert_eq!(config, EnhancementConfig::default());
        assert!(config.enables(EnhancementKind::Policy));
        assert!(config.enables(EnhancementKind::Delegate));

        let missing = EnhancementConfig::load(Some("/nonexistent/bastion.toml")).await.unwrap();
        assert_eq!(missing, EnhancementConfig::default());
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        fs::write(path, r#"{ "kinds": ["policy", "policy"] }"#).await.unwrap();
        assert!(EnhancementConfig::load(Some(path)).await.is_err());

        fs::write(path, r#"{ "transaction": { "timeoutMs": 0 } }"#).await.unwrap();
        assert!(EnhancementConfig::load(Some(path)).await.is_err());

        fs::write(path, "not json").await.unwrap();
        let err = EnhancementConfig::load(Some(path)).await.unwrap_err();
        assert!(err.to_string().contains("Failed to parse configuration file"));

        let yaml = Builder::new().suffix(".yaml").tempfile().unwrap();
        let yaml_path = yaml.path().to_str().unwrap();
        fs::write(yaml_path, "kinds: []").await.unwrap();
        assert!(EnhancementConfig::load(Some(yaml_path)).await.is_err());
    }

    #[test]
    fn test_merge_config() {
        let mut base = EnhancementConfig::default();
        base.transaction.max_wait_ms = Some(100);

        let mut override_config = EnhancementConfig::default();
        override_config.kinds = vec![EnhancementKind::Delegate];
        override_config.transaction.timeout_ms = Some(3000);
        override_config.logging.level = LogLevel::Trace;
        override_config.log_queries = true;

        base.merge(override_config);

        assert_eq!(base.kinds, vec![EnhancementKind::Delegate]);
        assert_eq!(base.transaction.max_wait_ms, Some(100));
        assert_eq!(base.transaction.timeout_ms, Some(3000));
        assert_eq!(base.logging.level, LogLevel::Trace);
        assert!(base.log_queries);
    }
}
