//! A single audit and its lifecycle

use crate::config::AuditConfig;
use crate::error::{AuditError, AuditResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;
use uuid::Uuid;
use warden_messaging::{AuditStage, ControlCode, Message, MessageCode, StateCode};

/// Lifecycle state of an audit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditState {
    New,
    Running,
    Paused,
    Stopped,
    Finished,
    Cancelled,
}

impl AuditState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuditState::Stopped | AuditState::Finished | AuditState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditState::New => "new",
            AuditState::Running => "running",
            AuditState::Paused => "paused",
            AuditState::Stopped => "stopped",
            AuditState::Finished => "finished",
            AuditState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AuditState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub plugin_id: String,
    pub identity: String,
    pub text: String,
    pub level: u8,
    pub is_error: bool,
    pub timestamp: DateTime<Utc>,
}

/// A result reported by a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub id: Uuid,
    /// Known when the result arrived through one of the audit's own calls
    pub plugin_id: Option<String>,
    pub payload: JsonValue,
}

/// One configured run of plugins against targets.
///
/// Transitions:
///
/// ```text
/// New -> Running <-> Paused
/// {New, Running, Paused} -> {Stopped, Cancelled}
/// Running -> Finished   (when no call is pending)
/// ```
#[derive(Debug, Clone)]
pub struct Audit {
    name: String,
    config: AuditConfig,
    state: AuditState,
    stage: AuditStage,
    pending: usize,
    progress: BTreeMap<(String, String), f32>,
    log: Vec<LogLine>,
    results: Vec<StoredResult>,
    warnings: usize,
    errors: usize,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl Audit {
    pub fn new(name: impl Into<String>, config: AuditConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: AuditState::New,
            stage: AuditStage::Start,
            pending: 0,
            progress: BTreeMap::new(),
            log: Vec::new(),
            results: Vec::new(),
            warnings: 0,
            errors: 0,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    pub fn state(&self) -> AuditState {
        self.state
    }

    /// Last stage reported for this audit
    pub fn stage(&self) -> AuditStage {
        self.stage
    }

    /// Calls started but not yet acknowledged
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn plugin_set(&self) -> &[String] {
        &self.config.plugins
    }

    /// Latest progress per (plugin id, call identity)
    pub fn progress(&self) -> impl Iterator<Item = (&str, &str, f32)> {
        self.progress
            .iter()
            .map(|((plugin, identity), pct)| (plugin.as_str(), identity.as_str(), *pct))
    }

    pub fn log(&self) -> &[LogLine] {
        &self.log
    }

    pub fn results(&self) -> &[StoredResult] {
        &self.results
    }

    pub fn result(&self, id: &Uuid) -> Option<&StoredResult> {
        self.results.iter().find(|r| &r.id == id)
    }

    pub fn warning_count(&self) -> usize {
        self.warnings
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// New -> Running, expecting `calls` acknowledgements
    pub fn start(&mut self, calls: usize) -> AuditResult<AuditStage> {
        self.require(AuditState::New, "start")?;
        self.pending = calls;
        self.started_at = Some(Utc::now());
        self.set_state(AuditState::Running, AuditStage::Start);
        Ok(AuditStage::Start)
    }

    /// Running -> Paused
    pub fn pause(&mut self) -> AuditResult<AuditStage> {
        self.require(AuditState::Running, "pause")?;
        self.set_state(AuditState::Paused, AuditStage::Paused);
        Ok(AuditStage::Paused)
    }

    /// Paused -> Running
    pub fn resume(&mut self) -> AuditResult<AuditStage> {
        self.require(AuditState::Paused, "resume")?;
        self.set_state(AuditState::Running, AuditStage::Running);
        Ok(AuditStage::Running)
    }

    /// Any non-terminal state -> Stopped
    pub fn stop(&mut self) -> AuditResult<AuditStage> {
        self.require_live("stop")?;
        self.set_state(AuditState::Stopped, AuditStage::Stop);
        Ok(AuditStage::Stop)
    }

    /// Any non-terminal state -> Cancelled
    pub fn cancel(&mut self) -> AuditResult<AuditStage> {
        self.require_live("cancel")?;
        self.set_state(AuditState::Cancelled, AuditStage::Cancel);
        Ok(AuditStage::Cancel)
    }

    /// Running -> Finished when nothing is pending
    pub fn finish_if_idle(&mut self) -> Option<AuditStage> {
        if self.state == AuditState::Running && self.pending == 0 {
            self.set_state(AuditState::Finished, AuditStage::Finish);
            Some(AuditStage::Finish)
        } else {
            None
        }
    }

    /// Whether the audit may be deleted in its current state
    pub fn is_removable(&self) -> bool {
        self.state == AuditState::New || self.state.is_terminal()
    }

    /// Take in a message addressed to this audit.
    ///
    /// `plugin_id` names the call the message came from, when known.
    /// Returns the stage the audit moved to, if the message caused a
    /// transition.
    pub fn recv_msg(&mut self, plugin_id: Option<&str>, message: &Message) -> Option<AuditStage> {
        match message.code() {
            MessageCode::Control(ControlCode::Ack) => {
                self.pending = self.pending.saturating_sub(1);
                self.finish_if_idle()
            }
            MessageCode::Control(
                code @ (ControlCode::Log | ControlCode::Warning | ControlCode::Error),
            ) => {
                match message.log_record() {
                    Ok(record) => {
                        match code {
                            ControlCode::Warning => self.warnings += 1,
                            ControlCode::Error => self.errors += 1,
                            _ => {}
                        }
                        self.log.push(LogLine {
                            plugin_id: record.plugin_id,
                            identity: record.identity,
                            text: record.text,
                            level: record.level,
                            is_error: code == ControlCode::Error,
                            timestamp: Utc::now(),
                        });
                    }
                    Err(e) => {
                        debug!(audit = %self.name, error = %e, "Ignoring malformed log message");
                    }
                }
                None
            }
            MessageCode::Control(ControlCode::StopAudit) => self.stop().ok(),
            MessageCode::Info(_) => {
                self.results.push(StoredResult {
                    id: Uuid::new_v4(),
                    plugin_id: plugin_id.map(str::to_string),
                    payload: message.payload().clone(),
                });
                None
            }
            MessageCode::State(StateCode::PluginStep) => {
                if let Ok(record) = message.progress_record() {
                    self.progress
                        .insert((record.plugin_id, record.identity), record.progress);
                }
                None
            }
            MessageCode::State(code @ (StateCode::PluginBegin | StateCode::PluginEnd)) => {
                if let Ok(record) = message.plugin_record() {
                    let pct = if code == StateCode::PluginEnd { 100.0 } else { 0.0 };
                    self.progress.insert((record.plugin_id, record.identity), pct);
                }
                None
            }
            _ => None,
        }
    }

    fn set_state(&mut self, state: AuditState, stage: AuditStage) {
        debug!(audit = %self.name, from = %self.state, to = %state, "Audit state change");
        self.state = state;
        self.stage = stage;
        if state.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
    }

    fn require(&self, expected: AuditState, operation: &'static str) -> AuditResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    fn require_live(&self, operation: &'static str) -> AuditResult<()> {
        if self.state.is_terminal() {
            Err(self.invalid(operation))
        } else {
            Ok(())
        }
    }

    fn invalid(&self, operation: &'static str) -> AuditError {
        AuditError::InvalidState {
            name: self.name.clone(),
            state: self.state,
            operation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use warden_messaging::{LogRecord, ProgressRecord};

    fn audit() -> Audit {
        Audit::new("nightly", AuditConfig::new(["10.0.0.1"], ["builtin:echo"]))
    }

    #[test]
    fn test_lifecycle() {
        let mut audit = audit();
        assert_eq!(audit.state(), AuditState::New);

        audit.start(2).unwrap();
        assert_eq!(audit.state(), AuditState::Running);

        audit.pause().unwrap();
        assert_eq!(audit.state(), AuditState::Paused);
        assert!(matches!(audit.pause(), Err(AuditError::InvalidState { .. })));

        audit.resume().unwrap();
        audit.stop().unwrap();
        assert_eq!(audit.state(), AuditState::Stopped);
        assert!(audit.ended_at().is_some());
    }

    #[test]
    fn test_pause_requires_running() {
        let mut audit = audit();
        let err = audit.pause().unwrap_err();
        assert_eq!(err.to_string(), "Cannot pause audit 'nightly' while it is new");
    }

    #[test]
    fn test_stop_and_cancel_from_any_live_state() {
        let mut fresh = audit();
        assert_eq!(fresh.stop().unwrap(), AuditStage::Stop);

        let mut paused = audit();
        paused.start(1).unwrap();
        paused.pause().unwrap();
        assert_eq!(paused.cancel().unwrap(), AuditStage::Cancel);
        assert_eq!(paused.state(), AuditState::Cancelled);

        assert!(paused.stop().is_err());
        assert!(paused.cancel().is_err());
    }

    #[test]
    fn test_finishes_when_last_ack_arrives() {
        let mut audit = audit();
        audit.start(2).unwrap();

        assert_eq!(audit.recv_msg(None, &Message::ack()), None);
        assert_eq!(audit.pending(), 1);
        assert_eq!(audit.recv_msg(None, &Message::ack()), Some(AuditStage::Finish));
        assert_eq!(audit.state(), AuditState::Finished);
    }

    #[test]
    fn test_paused_audit_finishes_on_resume() {
        let mut audit = audit();
        audit.start(1).unwrap();
        audit.pause().unwrap();

        assert_eq!(audit.recv_msg(None, &Message::ack()), None);
        assert_eq!(audit.state(), AuditState::Paused);

        audit.resume().unwrap();
        assert_eq!(audit.finish_if_idle(), Some(AuditStage::Finish));
        assert_eq!(audit.state(), AuditState::Finished);
    }

    #[test]
    fn test_records_log_results_and_progress() {
        let mut audit = audit();
        audit.start(1).unwrap();

        audit.recv_msg(None, &Message::log(LogRecord::new("builtin:echo", "c1", "hello", 1)));
        audit.recv_msg(None, &Message::warning(LogRecord::new("builtin:echo", "c1", "hmm", 1)));
        audit.recv_msg(None, &Message::error(LogRecord::new("builtin:echo", "c1", "bad", 1)));
        audit.recv_msg(Some("builtin:echo"), &Message::info(json!({"open": [22, 80]})));
        audit.recv_msg(None, &Message::progress(ProgressRecord::new("builtin:echo", "c1", 40.0)));
        audit.recv_msg(None, &Message::progress(ProgressRecord::new("builtin:echo", "c1", 90.0)));

        assert_eq!(audit.log().len(), 3);
        assert!(!audit.log()[0].is_error);
        assert!(audit.log()[2].is_error);
        assert_eq!(audit.warning_count(), 1);
        assert_eq!(audit.error_count(), 1);

        let result = &audit.results()[0];
        assert_eq!(result.plugin_id.as_deref(), Some("builtin:echo"));
        assert_eq!(audit.result(&result.id).unwrap().payload, json!({"open": [22, 80]}));

        let progress: Vec<_> = audit.progress().collect();
        assert_eq!(progress, vec![("builtin:echo", "c1", 90.0)]);
    }

    #[test]
    fn test_plugin_begin_and_end_track_progress() {
        let mut audit = audit();
        audit.start(1).unwrap();

        audit.recv_msg(None, &Message::plugin_begin("builtin:echo", "c1"));
        assert_eq!(audit.progress().collect::<Vec<_>>(), vec![("builtin:echo", "c1", 0.0)]);

        audit.recv_msg(None, &Message::progress(ProgressRecord::new("builtin:echo", "c1", 30.0)));
        audit.recv_msg(None, &Message::plugin_end("builtin:echo", "c1"));
        assert_eq!(audit.progress().collect::<Vec<_>>(), vec![("builtin:echo", "c1", 100.0)]);

        assert!(audit.log().is_empty());
        assert_eq!(audit.pending(), 1);
    }

    #[test]
    fn test_stop_audit_message() {
        let mut audit = audit();
        audit.start(3).unwrap();
        assert_eq!(
            audit.recv_msg(None, &Message::stop_audit("nightly")),
            Some(AuditStage::Stop)
        );
        assert_eq!(audit.state(), AuditState::Stopped);
    }

    #[test]
    fn test_removable_states() {
        let mut audit = audit();
        assert!(audit.is_removable());
        audit.start(1).unwrap();
        assert!(!audit.is_removable());
        audit.pause().unwrap();
        assert!(!audit.is_removable());
        audit.cancel().unwrap();
        assert!(audit.is_removable());
    }
}
