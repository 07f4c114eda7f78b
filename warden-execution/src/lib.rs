//! Warden execution engine
//!
//! Plugins are looked up by `module:class` id in a [`PluginRegistry`] and run
//! either inline or inside long-lived worker processes managed by a
//! [`ProcessPool`]. A plugin talks back only through its [`ReplyProxy`];
//! every call ends with exactly one Ack, whether the plugin succeeded,
//! failed, panicked or took its worker down with it.

pub mod bootstrap;
pub mod error;
pub mod plugin;
pub mod pool;
pub mod proxy;
pub mod spawner;
pub mod worker;

// Re-export main types
pub use bootstrap::invoke_plugin;
pub use error::{ExecutionError, ExecutionResult};
pub use plugin::{EchoPlugin, Plugin, PluginError, PluginFactory, PluginRegistry};
pub use pool::{CallHandle, PoolStats, ProcessPool};
pub use proxy::ReplyProxy;
pub use spawner::{CommandSpawner, LocalSpawner, PooledWorker, WorkerSpawner};
pub use worker::run_worker;
