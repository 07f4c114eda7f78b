//! Task pool and process pool configuration

use crate::error::ConfigResult;
use crate::validation::{validate_positive, Validatable};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Thread pool used for parallel fan-out helpers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskPoolConfig {
    /// Number of reusable worker threads
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

/// Process pool used for isolated plugin execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessPoolConfig {
    /// Number of long-lived worker processes (0 runs plugins in the caller)
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Recycle a worker after this many calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_after_tasks: Option<u64>,

    /// Worker executable (defaults to the current executable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_program: Option<PathBuf>,

    /// How long a freshly spawned worker may take to report ready
    #[serde(
        with = "crate::domains::utils::serde_duration",
        default = "default_ready_timeout"
    )]
    pub ready_timeout: Duration,

    /// Upper bound for a single plugin call (unbounded when absent)
    #[serde(
        with = "crate::domains::utils::serde_duration_option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub call_timeout: Option<Duration>,
}

impl Default for TaskPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
        }
    }
}

impl Default for ProcessPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            refresh_after_tasks: None,
            worker_program: None,
            ready_timeout: default_ready_timeout(),
            call_timeout: None,
        }
    }
}

impl ProcessPoolConfig {
    /// Configuration that runs every plugin call in the caller
    pub fn in_process() -> Self {
        Self {
            worker_count: 0,
            ..Default::default()
        }
    }

    /// Whether plugin calls bypass worker processes entirely
    pub fn is_in_process(&self) -> bool {
        self.worker_count == 0
    }
}

impl Validatable for TaskPoolConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.pool_size, "pool_size", self.domain_name())
    }

    fn domain_name(&self) -> &'static str {
        "task_pool"
    }
}

impl Validatable for ProcessPoolConfig {
    fn validate(&self) -> ConfigResult<()> {
        if let Some(refresh) = self.refresh_after_tasks {
            validate_positive(refresh, "refresh_after_tasks", self.domain_name())?;
        }

        validate_positive(
            self.ready_timeout.as_secs_f64(),
            "ready_timeout",
            self.domain_name(),
        )?;

        if let Some(timeout) = self.call_timeout {
            validate_positive(timeout.as_secs_f64(), "call_timeout", self.domain_name())?;
        }

        if let Some(program) = &self.worker_program {
            if program.as_os_str().is_empty() {
                return Err(self.validation_error("worker_program cannot be empty"));
            }
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "process_pool"
    }
}

fn default_pool_size() -> usize {
    4
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_ready_timeout() -> Duration {
    Duration::from_secs(10)
}
