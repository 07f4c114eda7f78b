//! Message error types

use thiserror::Error;

/// Message construction and decoding errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// The audit name was already assigned by the routing component
    #[error("Audit id already set to '{0}'")]
    AuditIdAlreadySet(String),

    /// Unknown message kind on the wire
    #[error("Unknown message kind: {0}")]
    UnknownKind(u8),

    /// Code not defined for the given kind
    #[error("Unknown {kind} code: {code}")]
    UnknownCode { kind: &'static str, code: u8 },

    /// Payload does not have the shape its code requires
    #[error("Invalid payload for {code}: {reason}")]
    InvalidPayload { code: String, reason: String },
}
