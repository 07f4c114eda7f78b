//! Parallel fan-out helpers for Warden
//!
//! [`TaskPool`] runs one callable over a batch of argument tuples on a
//! bounded set of persistent worker threads and returns the results in
//! input order. A failing or panicking call never fails the batch; its
//! slot is left empty and the cause is recorded in [`BatchResult::failures`].

pub mod batch;
pub mod error;
pub mod pool;

pub use batch::{Arg, BatchResult, TaskError, TaskFailure};
pub use error::{TaskPoolError, TaskPoolResult};
pub use pool::{panic_message, run, TaskPool, DEFAULT_POOL_SIZE};
