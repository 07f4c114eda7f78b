//! Audits and their orchestrator
//!
//! An [`Audit`] is one configured run of plugins against targets, with its
//! own lifecycle. The [`AuditOrchestrator`] owns every audit, starts their
//! plugin calls on the process pool and routes the resulting messages back
//! to the owning audit and on to external receivers.

pub mod audit;
pub mod config;
pub mod error;
pub mod orchestrator;

pub use audit::{Audit, AuditState, LogLine, StoredResult};
pub use config::AuditConfig;
pub use error::{AuditError, AuditResult};
pub use orchestrator::AuditOrchestrator;
