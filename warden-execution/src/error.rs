//! Error types for plugin execution

use thiserror::Error;
use warden_config::ConfigError;
use warden_ipc::IpcError;

/// Plugin execution errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Plugin already registered: {0}")]
    DuplicatePlugin(String),

    #[error("Invalid plugin id '{0}': expected 'module:class'")]
    InvalidPluginId(String),

    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Process pool has been stopped")]
    PoolStopped,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;

// Convert from IPC errors
impl From<IpcError> for ExecutionError {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::InvalidPluginId(id) => Self::InvalidPluginId(id),
            other => Self::IpcError(other.to_string()),
        }
    }
}

// Convert from config errors
impl From<ConfigError> for ExecutionError {
    fn from(err: ConfigError) -> Self {
        Self::ConfigurationError(err.to_string())
    }
}
