//! Message kinds and per-kind codes
//!
//! Numeric values are part of the wire format and must not be renumbered.

use crate::error::MessageError;
use std::fmt;

/// Top-level message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Control = 0,
    Info = 1,
    State = 2,
}

/// Control codes: acknowledgements, diagnostics and lifecycle commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlCode {
    Ack = 0,
    Error = 1,
    Warning = 2,
    Log = 3,
    Stop = 5,
    StopAudit = 11,
    // Reserved wire codes; never produced here
    StartUi = 20,
    StopUi = 21,
}

/// Info codes: results produced by plugins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InfoCode {
    Data = 0,
}

/// State codes: progress and lifecycle notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StateCode {
    PluginBegin = 0,
    PluginEnd = 1,
    PluginStep = 2,
    AuditStage = 3,
}

/// A code together with the kind it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageCode {
    Control(ControlCode),
    Info(InfoCode),
    State(StateCode),
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Control => "control",
            MessageKind::Info => "info",
            MessageKind::State => "state",
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, MessageError> {
        match value {
            0 => Ok(MessageKind::Control),
            1 => Ok(MessageKind::Info),
            2 => Ok(MessageKind::State),
            other => Err(MessageError::UnknownKind(other)),
        }
    }
}

impl TryFrom<u8> for ControlCode {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, MessageError> {
        Ok(match value {
            0 => ControlCode::Ack,
            1 => ControlCode::Error,
            2 => ControlCode::Warning,
            3 => ControlCode::Log,
            5 => ControlCode::Stop,
            11 => ControlCode::StopAudit,
            20 => ControlCode::StartUi,
            21 => ControlCode::StopUi,
            code => return Err(MessageError::UnknownCode { kind: "control", code }),
        })
    }
}

impl TryFrom<u8> for InfoCode {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, MessageError> {
        match value {
            0 => Ok(InfoCode::Data),
            code => Err(MessageError::UnknownCode { kind: "info", code }),
        }
    }
}

impl TryFrom<u8> for StateCode {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, MessageError> {
        Ok(match value {
            0 => StateCode::PluginBegin,
            1 => StateCode::PluginEnd,
            2 => StateCode::PluginStep,
            3 => StateCode::AuditStage,
            code => return Err(MessageError::UnknownCode { kind: "state", code }),
        })
    }
}

impl MessageCode {
    /// Rebuild a code from its wire representation
    pub fn from_parts(kind: u8, code: u8) -> Result<Self, MessageError> {
        match MessageKind::try_from(kind)? {
            MessageKind::Control => Ok(MessageCode::Control(ControlCode::try_from(code)?)),
            MessageKind::Info => Ok(MessageCode::Info(InfoCode::try_from(code)?)),
            MessageKind::State => Ok(MessageCode::State(StateCode::try_from(code)?)),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            MessageCode::Control(_) => MessageKind::Control,
            MessageCode::Info(_) => MessageKind::Info,
            MessageCode::State(_) => MessageKind::State,
        }
    }

    /// Numeric code within the kind
    pub fn code(&self) -> u8 {
        match self {
            MessageCode::Control(code) => *code as u8,
            MessageCode::Info(code) => *code as u8,
            MessageCode::State(code) => *code as u8,
        }
    }
}

impl fmt::Display for MessageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageCode::Control(code) => write!(f, "control/{:?}", code),
            MessageCode::Info(code) => write!(f, "info/{:?}", code),
            MessageCode::State(code) => write!(f, "state/{:?}", code),
        }
    }
}
