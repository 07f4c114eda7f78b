//! Task pool error types

use thiserror::Error;

/// Errors raised by the pool itself, never by a single task
#[derive(Debug, Error)]
pub enum TaskPoolError {
    /// The call's arguments cannot be expanded into a batch
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// The pool was stopped and cannot accept further batches
    #[error("Task pool has been shut down")]
    PoolShutdown,

    /// A worker or dispatcher thread could not be started
    #[error("Failed to spawn thread '{name}': {source}")]
    ThreadSpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

pub type TaskPoolResult<T> = Result<T, TaskPoolError>;
