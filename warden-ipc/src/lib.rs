//! Inter-process communication for Warden
//!
//! This crate provides the protocol spoken between the coordinator and its
//! plugin worker processes, and the newline-delimited JSON transport that
//! carries it.

pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use error::IpcError;
pub use protocol::{
    CoordinatorMessage, ExecutionContext, MessageEnvelope, ReplyChannel, WorkerError,
    WorkerMessage, WorkerStatus, IPC_PROTOCOL_VERSION,
};
pub use transport::{
    BoxedTransport, ChildProcessTransport, IpcTransport, LineReader, LineTransport, LineWriter,
    StdioTransport,
};
