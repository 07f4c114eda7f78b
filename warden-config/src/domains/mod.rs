//! Domain-specific configuration modules

pub mod audit;
pub mod bridge;
pub mod execution;
pub mod logging;
pub mod utils;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Main Warden configuration combining all domains
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WardenConfig {
    /// Thread pool for parallel helpers
    #[serde(default)]
    pub task_pool: execution::TaskPoolConfig,

    /// Worker processes for plugin execution
    #[serde(default)]
    pub process_pool: execution::ProcessPoolConfig,

    /// Audit defaults
    #[serde(default)]
    pub audit: audit::AuditDefaults,

    /// RPC bridge and push sink
    #[serde(default)]
    pub bridge: bridge::BridgeConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: logging::LoggingConfig,
}

impl WardenConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.task_pool.validate()?;
        self.process_pool.validate()?;
        self.audit.validate()?;
        self.bridge.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Render the configuration as a JSON value, as reported to remote clients
    pub fn to_json(&self) -> ConfigResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = WardenConfig::default();
        serde_yaml::to_string(&config)
            .unwrap_or_else(|_| "# Failed to generate sample config".to_string())
    }
}
