//! The plugin's only way back to the orchestrator

use serde_json::Value as JsonValue;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;
use warden_messaging::{LogRecord, Message, ProgressRecord};

/// Emits messages for one plugin call.
///
/// Every record built by the helpers is stamped with the plugin id and the
/// call identity. Emitting never blocks, so plugins may call it from any
/// thread; messages emitted after the call finished are dropped.
#[derive(Debug, Clone)]
pub struct ReplyProxy {
    plugin_id: String,
    identity: String,
    sink: UnboundedSender<Message>,
}

impl ReplyProxy {
    pub fn new(
        plugin_id: impl Into<String>,
        identity: impl Into<String>,
        sink: UnboundedSender<Message>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            identity: identity.into(),
            sink,
        }
    }

    /// A proxy together with the receiving end of its messages
    pub fn channel(
        plugin_id: impl Into<String>,
        identity: impl Into<String>,
    ) -> (Self, UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(plugin_id, identity, tx), rx)
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn emit(&self, message: Message) {
        if self.sink.send(message).is_err() {
            trace!(plugin_id = %self.plugin_id, "Reply channel closed, message dropped");
        }
    }

    pub fn log(&self, text: impl Into<String>, level: u8) {
        self.emit(Message::log(self.record(text, level)));
    }

    pub fn warning(&self, text: impl Into<String>) {
        self.emit(Message::warning(self.record(text, LogRecord::STANDARD)));
    }

    pub fn error(&self, text: impl Into<String>) {
        self.emit(Message::error(self.record(text, LogRecord::STANDARD)));
    }

    /// Report progress in percent
    pub fn progress(&self, progress: f32) {
        self.emit(Message::progress(ProgressRecord::new(
            self.plugin_id.clone(),
            self.identity.clone(),
            progress,
        )));
    }

    /// Report one result
    pub fn send_info(&self, value: JsonValue) {
        self.emit(Message::info(value));
    }

    fn record(&self, text: impl Into<String>, level: u8) -> LogRecord {
        LogRecord::new(self.plugin_id.clone(), self.identity.clone(), text, level)
    }
}
