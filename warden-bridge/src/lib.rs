//! Bridge between Warden and external processes
//!
//! A [`Bridge`] turns a pair of byte streams carrying `[command, ...args]`
//! packets into synchronous calls: replies (`ok`/`fail`) are matched to
//! calls in FIFO order by a single reader task, and every other packet is an
//! event handed to a callback. The bridge server child exposes the bridge as
//! an RPC endpoint over HTTP and forwards events to an optional push sink;
//! the orchestrator side answers its calls with a [`CommandServer`].

pub mod bridge;
pub mod commands;
pub mod error;
pub mod events;
pub mod packet;
pub mod push;
pub mod rpc;
pub mod server;
pub mod service;

pub use bridge::{Bridge, EventCallback};
pub use commands::AuditCommands;
pub use error::{BridgeError, BridgeResult, RemoteError};
pub use events::{event_packet, EventNotifier};
pub use packet::{Packet, PacketReader, PacketWriter};
pub use push::PushSink;
pub use rpc::{rpc_router, RpcClient, RpcError, RpcRequest};
pub use server::{launch_server, run_bridge_server, BridgeLink, ServedBridge};
pub use service::{normalize_command, CommandHandler, CommandServer, Outbox};
