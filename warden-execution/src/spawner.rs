//! Starting workers for the process pool

use crate::error::{ExecutionError, ExecutionResult};
use crate::plugin::PluginRegistry;
use crate::worker::run_worker;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use warden_config::ProcessPoolConfig;
use warden_ipc::{
    BoxedTransport, CoordinatorMessage, IpcError, LineReader, LineWriter, MessageEnvelope,
    WorkerMessage,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type BoxedReader = Box<dyn AsyncBufRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A started worker that has announced itself ready
pub struct PooledWorker {
    id: String,
    pid: Option<u32>,
    reader: LineReader<BoxedReader>,
    writer: LineWriter<BoxedWriter>,
    child: Option<Child>,
    task: Option<JoinHandle<ExecutionResult<()>>>,
    calls_served: u64,
}

impl PooledWorker {
    /// Wait for the worker's `Ready` announcement on `transport`
    pub async fn connect(
        id: impl Into<String>,
        transport: BoxedTransport,
        ready_timeout: Duration,
    ) -> ExecutionResult<Self> {
        let id = id.into();
        let (mut reader, writer) = transport.into_split();

        let envelope = tokio::time::timeout(ready_timeout, reader.receive::<CoordinatorMessage>())
            .await
            .map_err(|_| {
                ExecutionError::TimeoutError(format!(
                    "worker {} not ready after {:?}",
                    id, ready_timeout
                ))
            })??;

        let pid = match envelope.message {
            CoordinatorMessage::Ready { pid, .. } => pid,
            other => {
                return Err(ExecutionError::WorkerError(format!(
                    "worker {} sent {:?} before ready",
                    id, other
                )))
            }
        };

        Ok(Self {
            id,
            pid: Some(pid),
            reader,
            writer,
            child: None,
            task: None,
            calls_served: 0,
        })
    }

    fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }

    fn with_task(mut self, task: JoinHandle<ExecutionResult<()>>) -> Self {
        self.task = Some(task);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn calls_served(&self) -> u64 {
        self.calls_served
    }

    pub(crate) fn record_call(&mut self) {
        self.calls_served += 1;
    }

    pub(crate) async fn send(&mut self, message: WorkerMessage) -> Result<(), IpcError> {
        self.writer.send(&MessageEnvelope::new(message)).await
    }

    pub(crate) async fn receive(&mut self) -> Result<CoordinatorMessage, IpcError> {
        Ok(self.reader.receive::<CoordinatorMessage>().await?.message)
    }

    /// Ask the worker to exit and wait for it, killing it if it lingers
    pub async fn shutdown(mut self) {
        debug!(worker_id = %self.id, "Shutting down worker");
        let _ = self.send(WorkerMessage::Shutdown).await;
        let _ = self.writer.close().await;

        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(worker_id = %self.id, %status, "Worker exited"),
                Ok(Err(e)) => warn!(worker_id = %self.id, error = %e, "Failed to wait for worker"),
                Err(_) => {
                    warn!(worker_id = %self.id, "Worker did not exit in time, killing it");
                    let _ = child.kill().await;
                }
            }
        }
        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                abort.abort();
            }
        }
    }

    /// Drop a worker that can no longer be trusted
    pub async fn kill(mut self) {
        warn!(worker_id = %self.id, "Discarding worker");
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for PooledWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledWorker")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("calls_served", &self.calls_served)
            .finish()
    }
}

/// Starts workers on demand
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, worker_id: &str) -> ExecutionResult<PooledWorker>;
}

/// Runs each worker as a child process in hidden worker mode
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
    ready_timeout: Duration,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>, ready_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            ready_timeout,
        }
    }

    /// Use the configured worker program, or the running executable
    pub fn from_config(config: &ProcessPoolConfig) -> ExecutionResult<Self> {
        let program = match &config.worker_program {
            Some(program) => program.clone(),
            None => std::env::current_exe().map_err(|e| {
                ExecutionError::ConfigurationError(format!(
                    "cannot determine worker program: {}",
                    e
                ))
            })?,
        };
        Ok(Self::new(program, config.ready_timeout))
    }

    /// Extra arguments passed ahead of the worker flags
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[async_trait]
impl WorkerSpawner for CommandSpawner {
    async fn spawn(&self, worker_id: &str) -> ExecutionResult<PooledWorker> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--worker")
            .arg("--worker-id")
            .arg(worker_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExecutionError::SpawnFailed(format!("{}: {}", self.program.display(), e))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill().await;
            return Err(ExecutionError::SpawnFailed(
                "worker pipes unavailable".to_string(),
            ));
        };

        let transport = BoxedTransport::boxed(BufReader::new(stdout), stdin);
        match PooledWorker::connect(worker_id, transport, self.ready_timeout).await {
            Ok(worker) => {
                info!(worker_id, pid = ?worker.pid(), "Worker process started");
                Ok(worker.with_child(child))
            }
            Err(e) => {
                let _ = child.kill().await;
                Err(e)
            }
        }
    }
}

/// Runs each worker loop on a task of the current runtime, over in-memory
/// pipes. Used when process isolation is not wanted, and in tests.
#[derive(Debug, Clone)]
pub struct LocalSpawner {
    registry: Arc<PluginRegistry>,
    ready_timeout: Duration,
}

impl LocalSpawner {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self {
            registry,
            ready_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl WorkerSpawner for LocalSpawner {
    async fn spawn(&self, worker_id: &str) -> ExecutionResult<PooledWorker> {
        let (coordinator_write, worker_read) = tokio::io::duplex(64 * 1024);
        let (worker_write, coordinator_read) = tokio::io::duplex(64 * 1024);

        let worker_transport = BoxedTransport::boxed(BufReader::new(worker_read), worker_write);
        let task = tokio::spawn(run_worker(
            worker_id.to_string(),
            worker_transport,
            Arc::clone(&self.registry),
        ));

        let transport = BoxedTransport::boxed(BufReader::new(coordinator_read), coordinator_write);
        match PooledWorker::connect(worker_id, transport, self.ready_timeout).await {
            Ok(worker) => Ok(worker.with_task(task)),
            Err(e) => {
                task.abort();
                Err(e)
            }
        }
    }
}
