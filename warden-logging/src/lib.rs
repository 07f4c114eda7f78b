//! Tracing initialisation for Warden
//!
//! The coordinator logs according to its [`LoggingConfig`]. Worker processes
//! and the bridge server child speak their protocol on stdout, so they log to
//! stderr only.

pub mod init;

pub use init::{
    init_logging_from_config, init_simple_tracing, init_worker_tracing, LoggingGuard,
};
pub use warden_config::LoggingConfig;
