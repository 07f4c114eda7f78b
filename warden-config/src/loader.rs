//! Configuration loading and environment variable handling

use crate::domains::WardenConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::Path;
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
            prefix: "WARDEN".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<WardenConfig> {
        let content = std::fs::read_to_string(path)?;
        let mut config: WardenConfig = serde_yaml::from_str(&content)?;

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<WardenConfig> {
        let mut config = WardenConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<WardenConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut WardenConfig) -> ConfigResult<()> {
        self.apply_pool_overrides(config)?;
        self.apply_audit_overrides(&mut config.audit)?;
        self.apply_bridge_overrides(&mut config.bridge)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply task pool and process pool overrides
    fn apply_pool_overrides(&self, config: &mut WardenConfig) -> ConfigResult<()> {
        if let Some(size) = self.parse_env_var::<usize>("TASK_POOL_SIZE")? {
            config.task_pool.pool_size = size;
        }

        if let Some(count) = self.parse_env_var::<usize>("WORKER_COUNT")? {
            config.process_pool.worker_count = count;
        }

        if let Some(refresh) = self.parse_env_var::<u64>("REFRESH_AFTER_TASKS")? {
            config.process_pool.refresh_after_tasks = Some(refresh);
        }

        Ok(())
    }

    /// Apply audit overrides
    fn apply_audit_overrides(
        &self,
        config: &mut crate::domains::audit::AuditDefaults,
    ) -> ConfigResult<()> {
        if let Ok(prefix) = self.get_env_var("AUDIT_NAME_PREFIX") {
            config.name_prefix = prefix;
        }

        Ok(())
    }

    /// Apply bridge overrides
    fn apply_bridge_overrides(
        &self,
        config: &mut crate::domains::bridge::BridgeConfig,
    ) -> ConfigResult<()> {
        if let Some(enabled) = self.parse_env_var::<bool>("BRIDGE_ENABLED")? {
            config.enabled = enabled;
        }

        if let Ok(address) = self.get_env_var("BRIDGE_LISTEN_ADDRESS") {
            config.listen_address = address;
        }

        if let Some(port) = self.parse_env_var::<u16>("BRIDGE_LISTEN_PORT")? {
            config.listen_port = port;
        }

        if let Ok(push_url) = self.get_env_var("PUSH_URL") {
            config.push_url = Some(push_url);
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(
        &self,
        config: &mut crate::domains::logging::LoggingConfig,
    ) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = crate::domains::logging::LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = crate::domains::logging::LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    /// Parse an optional prefixed environment variable
    fn parse_env_var<T>(&self, name: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_env_var(name) {
            Ok(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", name, e))),
            Err(_) => Ok(None),
        }
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
