//! Bridge error types

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use warden_audit::AuditError;

/// Error carried by a `fail` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new("invalid_arguments", message)
    }

    pub fn not_implemented(command: &str) -> Self {
        Self::new("not_implemented", format!("Unknown command: {}", command))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }

    /// Read a `fail` payload; a bare string is accepted as a generic error
    pub fn from_payload(payload: Option<&JsonValue>) -> Self {
        match payload {
            Some(JsonValue::String(message)) => Self::new("error", message.clone()),
            Some(value) => serde_json::from_value(value.clone())
                .unwrap_or_else(|_| Self::new("error", value.to_string())),
            None => Self::new("error", "peer reported failure without details"),
        }
    }

    pub fn to_payload(&self) -> JsonValue {
        serde_json::json!({ "kind": self.kind, "message": self.message })
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

impl From<AuditError> for RemoteError {
    fn from(error: AuditError) -> Self {
        Self::new(error.kind(), error.to_string())
    }
}

/// Bridge errors
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Bridge is closed")]
    Closed,

    #[error("Remote call failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("Peer failed: {0}")]
    PeerFailed(String),

    #[error("Bridge server failed to start: {0}")]
    BootstrapFailed(String),

    #[error("Bridge server did not report within {0:?}")]
    BootstrapTimeout(Duration),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed packet: {0}")]
    Codec(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for BridgeError {
    fn from(error: reqwest::Error) -> Self {
        BridgeError::Http(error.to_string())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
