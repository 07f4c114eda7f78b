//! Turning bus messages into bridge events

use crate::packet::Packet;
use crate::service::Outbox;
use serde_json::{json, Value as JsonValue};
use tracing::trace;
use warden_messaging::{ControlCode, Message, MessageCode, Receiver, StateCode};

/// The event packet a message is reported as, if any.
///
/// - `("log" | "warn" | "error", audit, plugin_id, identity, text, level)`
/// - `("progress", audit, plugin_id, identity, pct)`
/// - `("plugin_begin" | "plugin_end", audit, plugin_id, identity)`
/// - `("stage", audit, stage)`
pub fn event_packet(message: &Message) -> Option<Packet> {
    let audit = JsonValue::String(message.audit_id().unwrap_or_default().to_string());

    let log_event = |name: &str| {
        let record = message.log_record().ok()?;
        Some(Packet::new(
            name,
            vec![
                audit.clone(),
                json!(record.plugin_id),
                json!(record.identity),
                json!(record.text),
                json!(record.level),
            ],
        ))
    };

    match message.code() {
        MessageCode::Control(ControlCode::Log) => log_event("log"),
        MessageCode::Control(ControlCode::Warning) => log_event("warn"),
        MessageCode::Control(ControlCode::Error) => log_event("error"),
        MessageCode::State(StateCode::PluginStep) => {
            let record = message.progress_record().ok()?;
            Some(Packet::new(
                "progress",
                vec![
                    audit,
                    json!(record.plugin_id),
                    json!(record.identity),
                    json!(record.progress),
                ],
            ))
        }
        MessageCode::State(code @ (StateCode::PluginBegin | StateCode::PluginEnd)) => {
            let record = message.plugin_record().ok()?;
            let name = if code == StateCode::PluginBegin { "plugin_begin" } else { "plugin_end" };
            Some(Packet::new(
                name,
                vec![audit, json!(record.plugin_id), json!(record.identity)],
            ))
        }
        MessageCode::State(StateCode::AuditStage) => {
            let stage = message.audit_stage().ok()?;
            Some(Packet::new("stage", vec![audit, json!(stage.as_str())]))
        }
        _ => None,
    }
}

/// Forwards bus messages to the bridge peer as events
#[derive(Debug, Clone)]
pub struct EventNotifier {
    outbox: Outbox,
}

impl EventNotifier {
    pub fn new(outbox: Outbox) -> Self {
        Self { outbox }
    }
}

impl Receiver for EventNotifier {
    fn recv_msg(&self, message: &Message) {
        if let Some(packet) = event_packet(message) {
            if self.outbox.send(packet).is_err() {
                trace!("Bridge outbox closed, dropping event");
            }
        }
    }
}
