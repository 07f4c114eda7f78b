//! Audit error types

use crate::audit::AuditState;
use thiserror::Error;
use warden_execution::ExecutionError;

/// Audit lifecycle errors
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit already exists: {0}")]
    AlreadyExists(String),

    #[error("Cannot {operation} audit '{name}' while it is {state}")]
    InvalidState {
        name: String,
        state: AuditState,
        operation: &'static str,
    },

    #[error("Audit not found: {0}")]
    NotFound(String),

    #[error("Invalid audit configuration: {0}")]
    InvalidConfig(String),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),
}

impl AuditError {
    /// Stable identifier for the error class, used at remote boundaries
    pub fn kind(&self) -> &'static str {
        match self {
            AuditError::AlreadyExists(_) => "already_exists",
            AuditError::InvalidState { .. } => "invalid_state",
            AuditError::NotFound(_) => "not_found",
            AuditError::InvalidConfig(_) => "invalid_arguments",
            AuditError::Execution(_) => "execution_error",
        }
    }
}

pub type AuditResult<T> = Result<T, AuditError>;
