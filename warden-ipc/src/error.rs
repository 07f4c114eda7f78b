//! IPC error types

use thiserror::Error;

/// Failures while exchanging envelopes with a worker
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A line that is not a valid envelope
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    /// The peer closed its end of the pipe
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },

    /// Plugin id is not of the form `module:class`
    #[error("Invalid plugin id '{0}': expected 'module:class'")]
    InvalidPluginId(String),
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            IpcError::IoError(err.to_string())
        } else if err.is_data() || err.is_syntax() || err.is_eof() {
            IpcError::DeserializationError(err.to_string())
        } else {
            IpcError::SerializationError(err.to_string())
        }
    }
}
