//! IPC protocol definitions and message types

use crate::error::IpcError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;
use warden_messaging::Message;

/// IPC protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Handle a worker uses to address messages back to the caller.
///
/// Only the id crosses the process boundary; the coordinator maps it back
/// to the call that is waiting for replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplyChannel {
    pub id: Uuid,
}

impl ReplyChannel {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }
}

impl Default for ReplyChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReplyChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// What plugin to run, for which audit, and where to send its output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub module_ref: String,
    pub class_name: String,
    pub audit_id: String,
    pub config: BTreeMap<String, JsonValue>,
    pub reply_channel: ReplyChannel,
}

impl ExecutionContext {
    pub fn new(
        module_ref: impl Into<String>,
        class_name: impl Into<String>,
        audit_id: impl Into<String>,
        config: BTreeMap<String, JsonValue>,
    ) -> Self {
        Self {
            module_ref: module_ref.into(),
            class_name: class_name.into(),
            audit_id: audit_id.into(),
            config,
            reply_channel: ReplyChannel::new(),
        }
    }

    /// Build a context from a `module:class` plugin id
    pub fn for_plugin(
        plugin_id: &str,
        audit_id: impl Into<String>,
        config: BTreeMap<String, JsonValue>,
    ) -> Result<Self, IpcError> {
        match plugin_id.split_once(':') {
            Some((module, class)) if !module.is_empty() && !class.is_empty() => {
                Ok(Self::new(module, class, audit_id, config))
            }
            _ => Err(IpcError::InvalidPluginId(plugin_id.to_string())),
        }
    }

    /// The registry key of the plugin, `module:class`
    pub fn plugin_id(&self) -> String {
        format!("{}:{}", self.module_ref, self.class_name)
    }
}

/// Messages sent from coordinator to worker processes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Run one method of a plugin
    ExecutePlugin {
        correlation_id: Uuid,
        context: ExecutionContext,
        method: String,
        args: Vec<JsonValue>,
        kwargs: Map<String, JsonValue>,
    },

    /// Health check ping
    Ping { correlation_id: Uuid },

    /// Shutdown signal
    Shutdown,
}

/// Messages sent from worker processes to coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    /// Worker ready for work
    Ready { worker_id: String, pid: u32 },

    /// A message produced by the plugin, streamed as soon as it is emitted
    Emit {
        correlation_id: Uuid,
        reply_channel: ReplyChannel,
        message: Message,
    },

    /// Health check response
    Pong {
        correlation_id: Uuid,
        status: WorkerStatus,
    },

    /// Worker error outside of any plugin's own reporting
    Error {
        correlation_id: Option<Uuid>,
        error: WorkerError,
    },
}

/// Worker status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub calls_served: u64,
    pub calls_failed: u64,
}

impl WorkerStatus {
    pub fn new(worker_id: String, pid: u32) -> Self {
        let now = Utc::now();
        Self {
            worker_id,
            pid,
            started_at: now,
            last_activity: now,
            calls_served: 0,
            calls_failed: 0,
        }
    }

    /// Record a finished plugin call
    pub fn record_call(&mut self, success: bool) {
        self.calls_served += 1;
        if !success {
            self.calls_failed += 1;
        }
        self.last_activity = Utc::now();
    }
}

/// Worker error types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum WorkerError {
    /// Communication error
    CommunicationError { error: String },

    /// Message parse error
    MessageParseError { error: String },
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::CommunicationError { error } => {
                write!(f, "Communication error: {}", error)
            }
            WorkerError::MessageParseError { error } => {
                write!(f, "Message parse error: {}", error)
            }
        }
    }
}

impl std::error::Error for WorkerError {}

/// Message envelope for all IPC communications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    /// Create a new message envelope
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if protocol version is compatible
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == IPC_PROTOCOL_VERSION
    }
}
