//! Harness configuration
//!
//! Defaults match what most test suites want; a YAML file named by
//! `FUSE_HARNESS_CONFIG` can override any of them:
//!
//! ```yaml
//! logging:
//!   level: debug
//! teardown:
//!   events_close_timeout: 10s
//!   join_timeout: 10s
//!   slow_join_warning: 100ms
//! unmount:
//!   command: fusermount
//!   args: ["-u", "-z"]
//! store:
//!   env_var: HARNESS_LOCAL_STORE
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::env::substitute_env_vars;

/// Environment variable naming an optional config file
pub const CONFIG_ENV_VAR: &str = "FUSE_HARNESS_CONFIG";

/// Top-level harness configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub logging: LoggingConfig,
    pub teardown: TeardownConfig,
    pub unmount: UnmountConfig,
    pub store: StoreConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Bounds on the waits performed while tearing a mount down
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TeardownConfig {
    /// How long to wait for the driver's event channel to close
    #[serde(with = "humantime_serde")]
    pub events_close_timeout: Duration,
    /// How long to wait for the service thread after unmounting
    #[serde(with = "humantime_serde")]
    pub join_timeout: Duration,
    /// Joins slower than this are logged
    #[serde(with = "humantime_serde")]
    pub slow_join_warning: Duration,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            events_close_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(10),
            slow_join_warning: Duration::from_millis(100),
        }
    }
}

/// External command used to force-detach the mount point
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UnmountConfig {
    pub command: String,
    pub args: Vec<String>,
}

impl Default for UnmountConfig {
    fn default() -> Self {
        #[cfg(target_os = "macos")]
        {
            Self {
                command: "umount".to_string(),
                args: vec!["-f".to_string()],
            }
        }
        #[cfg(not(target_os = "macos"))]
        {
            Self {
                command: "fusermount".to_string(),
                args: vec!["-u".to_string(), "-z".to_string()],
            }
        }
    }
}

/// Local backing store settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Variable through which the driver finds the store
    pub env_var: String,
    /// Name prefix for the temporary store directory
    pub prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            env_var: "HARNESS_LOCAL_STORE".to_string(),
            prefix: "fuse-harness-store-".to_string(),
        }
    }
}

impl HarnessConfig {
    /// Load from `FUSE_HARNESS_CONFIG` if set, otherwise use defaults
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) if !path.is_empty() => Self::from_file(Path::new(&path)),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content)?;
        // An empty document means "all defaults"
        let config: HarnessConfig = if content.trim().is_empty() {
            HarnessConfig::default()
        } else {
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let teardown = &self.teardown;
        if teardown.events_close_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "teardown.events_close_timeout must be greater than zero".to_string(),
            ));
        }
        if teardown.join_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "teardown.join_timeout must be greater than zero".to_string(),
            ));
        }
        if self.unmount.command.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "unmount.command cannot be empty".to_string(),
            ));
        }
        if self.store.env_var.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "store.env_var cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.teardown.events_close_timeout, Duration::from_secs(10));
        assert_eq!(config.teardown.join_timeout, Duration::from_secs(10));
        assert_eq!(config.teardown.slow_join_warning, Duration::from_millis(100));
        assert_eq!(config.store.env_var, "HARNESS_LOCAL_STORE");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_override_keeps_other_defaults() {
        let yaml = r#"
teardown:
  join_timeout: 250ms
unmount:
  command: "true"
  args: []
"#;
        let config = HarnessConfig::from_str(yaml).unwrap();
        assert_eq!(config.teardown.join_timeout, Duration::from_millis(250));
        assert_eq!(config.teardown.events_close_timeout, Duration::from_secs(10));
        assert_eq!(config.unmount.command, "true");
        assert!(config.unmount.args.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = HarnessConfig::from_str("").unwrap();
        assert_eq!(config.teardown.join_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("HARNESS_TEST_LEVEL", "debug");
        let config = HarnessConfig::from_str("logging:\n  level: ${HARNESS_TEST_LEVEL}\n").unwrap();
        assert_eq!(config.logging.level, "debug");
        std::env::remove_var("HARNESS_TEST_LEVEL");
    }

    #[test]
    fn test_zero_join_timeout_rejected() {
        let err = HarnessConfig::from_str("teardown:\n  join_timeout: 0s\n").unwrap_err();
        assert!(
            err.to_string().contains("join_timeout"),
            "Error should name the field: {}",
            err
        );
    }

    #[test]
    fn test_empty_unmount_command_rejected() {
        let err = HarnessConfig::from_str("unmount:\n  command: \"\"\n").unwrap_err();
        assert!(err.to_string().contains("unmount.command"));
    }

    #[test]
    fn test_bad_yaml() {
        let result = HarnessConfig::from_str("teardown: [not, a, map]");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_from_missing_file() {
        let result = HarnessConfig::from_file(Path::new("/nonexistent/fuse-harness.yaml"));
        assert!(matches!(result, Err(ConfigError::ReadError(_, _))));
    }
}
