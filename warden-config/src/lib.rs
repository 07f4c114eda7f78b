//! Domain-driven configuration management for Warden
//!
//! Configuration is split by functional domain. Each domain carries its own
//! defaults and validation, and every domain can be overridden from
//! `WARDEN_*` environment variables.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{
    audit::AuditDefaults, bridge::BridgeConfig, execution::ProcessPoolConfig,
    execution::TaskPoolConfig, logging::LoggingConfig, WardenConfig,
};

// Re-export utilities
pub use domains::utils::{serde_duration, serde_duration_option};
