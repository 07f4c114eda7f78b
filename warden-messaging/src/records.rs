//! Typed payloads carried by control and state messages

use serde::{Deserialize, Serialize};
use std::fmt;

/// A log line, warning or error reported by a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub plugin_id: String,
    pub identity: String,
    pub text: String,
    pub level: u8,
}

/// Progress of one plugin call, in percent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub plugin_id: String,
    pub identity: String,
    pub progress: f32,
}

/// The plugin call a begin or end notification refers to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRecord {
    pub plugin_id: String,
    pub identity: String,
}

/// Audit lifecycle stage as reported to external consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStage {
    Start,
    Running,
    Paused,
    Finish,
    Stop,
    Cancel,
}

impl LogRecord {
    /// Always shown
    pub const STANDARD: u8 = 1;
    /// Shown in verbose mode
    pub const VERBOSE: u8 = 2;
    /// Shown in very verbose mode
    pub const MORE_VERBOSE: u8 = 3;

    pub fn new(
        plugin_id: impl Into<String>,
        identity: impl Into<String>,
        text: impl Into<String>,
        level: u8,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            identity: identity.into(),
            text: text.into(),
            level,
        }
    }
}

impl ProgressRecord {
    /// Progress is clamped to 0..=100
    pub fn new(plugin_id: impl Into<String>, identity: impl Into<String>, progress: f32) -> Self {
        let progress = if progress.is_nan() { 0.0 } else { progress.clamp(0.0, 100.0) };
        Self {
            plugin_id: plugin_id.into(),
            identity: identity.into(),
            progress,
        }
    }
}

impl PluginRecord {
    pub fn new(plugin_id: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            identity: identity.into(),
        }
    }
}

impl AuditStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStage::Start => "start",
            AuditStage::Running => "running",
            AuditStage::Paused => "paused",
            AuditStage::Finish => "finish",
            AuditStage::Stop => "stop",
            AuditStage::Cancel => "cancel",
        }
    }
}

impl fmt::Display for AuditStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
