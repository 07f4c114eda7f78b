//! Message bus for Warden
//!
//! Plugins report back through [`Message`]s: a kind, a per-kind code, an
//! opaque JSON payload and the name of the audit the message belongs to.
//! The [`Dispatcher`] fans each message out to registered [`Receiver`]s,
//! synchronously and in registration order.

pub mod codes;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod records;

pub use codes::{ControlCode, InfoCode, MessageCode, MessageKind, StateCode};
pub use dispatcher::{Dispatcher, Receiver};
pub use error::MessageError;
pub use message::Message;
pub use records::{AuditStage, LogRecord, PluginRecord, ProgressRecord};
