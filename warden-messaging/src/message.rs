//! The message envelope

use crate::codes::{ControlCode, InfoCode, MessageCode, MessageKind, StateCode};
use crate::error::MessageError;
use crate::records::{AuditStage, LogRecord, PluginRecord, ProgressRecord};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A typed message travelling from plugins to the orchestrator and beyond.
///
/// Everything but the audit id is fixed at construction. The audit id is
/// assigned once, by whichever component routes the message to its audit.
///
/// On the wire a message is the 4-tuple `[kind, code, payload, audit_id]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireMessage", try_from = "WireMessage")]
pub struct Message {
    code: MessageCode,
    payload: JsonValue,
    audit_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct WireMessage(u8, u8, JsonValue, Option<String>);

impl From<Message> for WireMessage {
    fn from(message: Message) -> Self {
        WireMessage(
            message.code.kind() as u8,
            message.code.code(),
            message.payload,
            message.audit_id,
        )
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = MessageError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let WireMessage(kind, code, payload, audit_id) = wire;
        Ok(Message {
            code: MessageCode::from_parts(kind, code)?,
            payload,
            audit_id,
        })
    }
}

impl Message {
    pub fn new(code: MessageCode, payload: JsonValue) -> Self {
        Self {
            code,
            payload,
            audit_id: None,
        }
    }

    /// End-of-call acknowledgement
    pub fn ack() -> Self {
        Self::control(ControlCode::Ack, JsonValue::Null)
    }

    pub fn error(record: LogRecord) -> Self {
        Self::control(ControlCode::Error, to_payload(&record))
    }

    pub fn warning(record: LogRecord) -> Self {
        Self::control(ControlCode::Warning, to_payload(&record))
    }

    pub fn log(record: LogRecord) -> Self {
        Self::control(ControlCode::Log, to_payload(&record))
    }

    /// Ask the receiving process to shut down
    pub fn stop() -> Self {
        Self::control(ControlCode::Stop, JsonValue::Null)
    }

    /// Ask the addressed audit to stop
    pub fn stop_audit(audit_id: impl Into<String>) -> Self {
        let mut message = Self::control(ControlCode::StopAudit, JsonValue::Null);
        message.audit_id = Some(audit_id.into());
        message
    }

    /// A result produced by a plugin
    pub fn info(payload: JsonValue) -> Self {
        Self::new(MessageCode::Info(InfoCode::Data), payload)
    }

    pub fn progress(record: ProgressRecord) -> Self {
        Self::new(MessageCode::State(StateCode::PluginStep), to_payload(&record))
    }

    /// A plugin call is about to run
    pub fn plugin_begin(plugin_id: &str, identity: &str) -> Self {
        Self::new(
            MessageCode::State(StateCode::PluginBegin),
            to_payload(&PluginRecord::new(plugin_id, identity)),
        )
    }

    /// A plugin call has returned, failed or panicked
    pub fn plugin_end(plugin_id: &str, identity: &str) -> Self {
        Self::new(
            MessageCode::State(StateCode::PluginEnd),
            to_payload(&PluginRecord::new(plugin_id, identity)),
        )
    }

    pub fn stage(stage: AuditStage) -> Self {
        Self::new(MessageCode::State(StateCode::AuditStage), to_payload(&stage))
    }

    fn control(code: ControlCode, payload: JsonValue) -> Self {
        Self::new(MessageCode::Control(code), payload)
    }

    pub fn kind(&self) -> MessageKind {
        self.code.kind()
    }

    pub fn code(&self) -> MessageCode {
        self.code
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn audit_id(&self) -> Option<&str> {
        self.audit_id.as_deref()
    }

    /// Assign the owning audit; only the first assignment succeeds
    pub fn set_audit_id(&mut self, audit_id: impl Into<String>) -> Result<(), MessageError> {
        match &self.audit_id {
            Some(existing) => Err(MessageError::AuditIdAlreadySet(existing.clone())),
            None => {
                self.audit_id = Some(audit_id.into());
                Ok(())
            }
        }
    }

    /// Builder form of [`Message::set_audit_id`]
    pub fn with_audit_id(mut self, audit_id: impl Into<String>) -> Result<Self, MessageError> {
        self.set_audit_id(audit_id)?;
        Ok(self)
    }

    pub fn is_control(&self, code: ControlCode) -> bool {
        self.code == MessageCode::Control(code)
    }

    pub fn is_state(&self, code: StateCode) -> bool {
        self.code == MessageCode::State(code)
    }

    pub fn is_ack(&self) -> bool {
        self.is_control(ControlCode::Ack)
    }

    /// Decode the payload of a log, warning or error message
    pub fn log_record(&self) -> Result<LogRecord, MessageError> {
        match self.code {
            MessageCode::Control(ControlCode::Log | ControlCode::Warning | ControlCode::Error) => {
                self.decode_payload()
            }
            _ => Err(self.payload_error("not a log message")),
        }
    }

    /// Decode the payload of a progress message
    pub fn progress_record(&self) -> Result<ProgressRecord, MessageError> {
        if self.is_state(StateCode::PluginStep) {
            self.decode_payload()
        } else {
            Err(self.payload_error("not a progress message"))
        }
    }

    /// Decode the payload of a plugin begin or end message
    pub fn plugin_record(&self) -> Result<PluginRecord, MessageError> {
        if self.is_state(StateCode::PluginBegin) || self.is_state(StateCode::PluginEnd) {
            self.decode_payload()
        } else {
            Err(self.payload_error("not a plugin begin or end message"))
        }
    }

    /// Decode the payload of an audit stage message
    pub fn audit_stage(&self) -> Result<AuditStage, MessageError> {
        if self.is_state(StateCode::AuditStage) {
            self.decode_payload()
        } else {
            Err(self.payload_error("not a stage message"))
        }
    }

    fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| self.payload_error(e.to_string()))
    }

    fn payload_error(&self, reason: impl Into<String>) -> MessageError {
        MessageError::InvalidPayload {
            code: self.code.to_string(),
            reason: reason.into(),
        }
    }
}

fn to_payload<T: Serialize>(value: &T) -> JsonValue {
    // records are plain structs of strings and numbers
    serde_json::to_value(value).unwrap_or(JsonValue::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_audit_id_is_assigned_once() {
        let mut message = Message::info(json!({"port": 443}));
        assert_eq!(message.audit_id(), None);

        message.set_audit_id("nightly").unwrap();
        assert_eq!(message.audit_id(), Some("nightly"));

        let err = message.set_audit_id("other").unwrap_err();
        assert_eq!(err, MessageError::AuditIdAlreadySet("nightly".to_string()));
        assert_eq!(message.audit_id(), Some("nightly"));
    }

    #[test]
    fn test_wire_shape_is_a_tuple() {
        let message = Message::log(LogRecord::new("builtin:echo", "abc", "hello", 1))
            .with_audit_id("nightly")
            .unwrap();

        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(wire[0], json!(0));
        assert_eq!(wire[1], json!(3));
        assert_eq!(wire[2]["text"], json!("hello"));
        assert_eq!(wire[3], json!("nightly"));

        let decoded: Message = serde_json::from_value(wire).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_unknown_code_is_rejected_on_decode() {
        let result: Result<Message, _> = serde_json::from_value(json!([1, 7, null, null]));
        assert!(result.is_err());
    }

    #[test]
    fn test_typed_payload_accessors() {
        let message = Message::error(LogRecord::new("p", "i", "boom", LogRecord::STANDARD));
        assert_eq!(message.log_record().unwrap().text, "boom");
        assert!(message.progress_record().is_err());

        let message = Message::progress(ProgressRecord::new("p", "i", 50.0));
        assert_eq!(message.progress_record().unwrap().progress, 50.0);

        let message = Message::stage(AuditStage::Finish);
        assert_eq!(message.audit_stage().unwrap(), AuditStage::Finish);

        let message = Message::plugin_end("builtin:echo", "call-1");
        assert!(message.is_state(StateCode::PluginEnd));
        assert_eq!(
            message.plugin_record().unwrap(),
            PluginRecord::new("builtin:echo", "call-1")
        );
        assert!(Message::ack().plugin_record().is_err());
    }

    #[test]
    fn test_stop_audit_is_addressed() {
        let message = Message::stop_audit("nightly");
        assert!(message.is_control(ControlCode::StopAudit));
        assert_eq!(message.audit_id(), Some("nightly"));
    }
}
