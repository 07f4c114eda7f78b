//! Bounded pool of plugin workers

use crate::bootstrap::invoke_plugin;
use crate::error::{ExecutionError, ExecutionResult};
use crate::plugin::PluginRegistry;
use crate::proxy::ReplyProxy;
use crate::spawner::{PooledWorker, WorkerSpawner};
use serde_json::{Map, Value as JsonValue};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_config::ProcessPoolConfig;
use warden_ipc::{CoordinatorMessage, ExecutionContext, ReplyChannel, WorkerMessage};
use warden_messaging::{ControlCode, LogRecord, Message};

/// Runs plugin calls, inline or on a bounded set of long-lived workers.
///
/// With `worker_count == 0` every call runs to completion inside
/// [`ProcessPool::submit`]. Otherwise `submit` returns at once and a
/// background task drives the call on a free worker. Workers are started
/// lazily, reused across calls and retired after `refresh_after_tasks`
/// calls. A worker that stops answering mid-call is discarded; the call
/// is closed with an error and an Ack.
#[derive(Clone)]
pub struct ProcessPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: ProcessPoolConfig,
    registry: Arc<PluginRegistry>,
    spawner: Arc<dyn WorkerSpawner>,
    idle: Mutex<Vec<PooledWorker>>,
    permits: Arc<Semaphore>,
    stopped: AtomicBool,
    next_worker: AtomicU64,
    workers_spawned: AtomicU64,
    workers_retired: AtomicU64,
    workers_discarded: AtomicU64,
    calls_completed: AtomicU64,
    calls_failed: AtomicU64,
}

/// Snapshot of pool activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub in_process: bool,
    pub worker_count: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub workers_spawned: u64,
    pub workers_retired: u64,
    pub workers_discarded: u64,
    pub calls_completed: u64,
    pub calls_failed: u64,
}

/// Stream of messages produced by one call.
///
/// Messages come stamped with the call's audit id. The stream ends after
/// the Ack; should the producer vanish without one, an error and an Ack
/// are synthesized so consumers always see the call finish.
pub struct CallHandle {
    correlation_id: Uuid,
    audit_id: String,
    plugin_id: String,
    identity: String,
    rx: UnboundedReceiver<Message>,
    state: HandleState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Open,
    Orphaned,
    Finished,
}

impl CallHandle {
    fn new(
        correlation_id: Uuid,
        context: &ExecutionContext,
        rx: UnboundedReceiver<Message>,
    ) -> Self {
        Self {
            correlation_id,
            audit_id: context.audit_id.clone(),
            plugin_id: context.plugin_id(),
            identity: context.reply_channel.to_string(),
            rx,
            state: HandleState::Open,
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn audit_id(&self) -> &str {
        &self.audit_id
    }

    /// Next message of the call, or `None` once the Ack has been returned
    pub async fn next(&mut self) -> Option<Message> {
        let message = match self.state {
            HandleState::Finished => return None,
            HandleState::Orphaned => {
                self.state = HandleState::Finished;
                Message::ack()
            }
            HandleState::Open => match self.rx.recv().await {
                Some(message) => {
                    if message.is_ack() {
                        self.state = HandleState::Finished;
                    }
                    message
                }
                None => {
                    self.state = HandleState::Orphaned;
                    Message::error(LogRecord::new(
                        self.plugin_id.clone(),
                        self.identity.clone(),
                        format!("Call to {} ended without acknowledgement", self.plugin_id),
                        LogRecord::STANDARD,
                    ))
                }
            },
        };
        Some(self.stamp(message))
    }

    /// Collect every message of the call, Ack included
    pub async fn wait(mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Some(message) = self.next().await {
            messages.push(message);
        }
        messages
    }

    fn stamp(&self, mut message: Message) -> Message {
        if message.audit_id().is_none() {
            // Unset, so the assignment cannot fail.
            let _ = message.set_audit_id(self.audit_id.clone());
        }
        message
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("correlation_id", &self.correlation_id)
            .field("audit_id", &self.audit_id)
            .field("plugin_id", &self.plugin_id)
            .finish()
    }
}

impl ProcessPool {
    pub fn new(
        config: ProcessPoolConfig,
        registry: Arc<PluginRegistry>,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.worker_count.max(1)));
        info!(
            workers = config.worker_count,
            refresh_after = ?config.refresh_after_tasks,
            "Creating process pool"
        );
        Self {
            inner: Arc::new(PoolInner {
                config,
                registry,
                spawner,
                idle: Mutex::new(Vec::new()),
                permits,
                stopped: AtomicBool::new(false),
                next_worker: AtomicU64::new(0),
                workers_spawned: AtomicU64::new(0),
                workers_retired: AtomicU64::new(0),
                workers_discarded: AtomicU64::new(0),
                calls_completed: AtomicU64::new(0),
                calls_failed: AtomicU64::new(0),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &ProcessPoolConfig {
        &self.inner.config
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Start one plugin call.
    ///
    /// Fails only when the pool has been stopped; every other failure is
    /// reported through the returned handle.
    pub async fn submit(
        &self,
        context: ExecutionContext,
        method: impl Into<String>,
        args: Vec<JsonValue>,
        kwargs: Map<String, JsonValue>,
    ) -> ExecutionResult<CallHandle> {
        if self.is_stopped() {
            return Err(ExecutionError::PoolStopped);
        }

        let method = method.into();
        let correlation_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = CallHandle::new(correlation_id, &context, rx);

        if self.inner.config.is_in_process() {
            let proxy = ReplyProxy::new(context.plugin_id(), context.reply_channel.to_string(), tx);
            let success =
                invoke_plugin(&self.inner.registry, &context, &method, &args, &kwargs, proxy);
            self.inner.record_call(success);
            return Ok(handle);
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner
                .drive_call(correlation_id, context, method, args, kwargs, tx)
                .await;
        });
        Ok(handle)
    }

    /// Submit a call and collect all of its messages
    pub async fn execute(
        &self,
        context: ExecutionContext,
        method: impl Into<String>,
        args: Vec<JsonValue>,
        kwargs: Map<String, JsonValue>,
    ) -> ExecutionResult<Vec<Message>> {
        Ok(self.submit(context, method, args, kwargs).await?.wait().await)
    }

    /// Refuse new calls and shut idle workers down.
    ///
    /// Calls already running finish normally; their workers are shut down
    /// instead of returning to the pool. Calls still waiting for a worker
    /// are closed with an error.
    pub async fn stop(&self) {
        let idle = {
            let mut idle = self.inner.lock_idle();
            if self.inner.stopped.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut *idle)
        };
        self.inner.permits.close();

        info!(idle = idle.len(), "Stopping process pool");
        for worker in idle {
            worker.shutdown().await;
            self.inner.workers_retired.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let in_process = inner.config.is_in_process();
        let busy = if in_process || inner.permits.is_closed() {
            0
        } else {
            inner.config.worker_count.saturating_sub(inner.permits.available_permits())
        };
        PoolStats {
            in_process,
            worker_count: inner.config.worker_count,
            idle_workers: inner.lock_idle().len(),
            busy_workers: busy,
            workers_spawned: inner.workers_spawned.load(Ordering::Relaxed),
            workers_retired: inner.workers_retired.load(Ordering::Relaxed),
            workers_discarded: inner.workers_discarded.load(Ordering::Relaxed),
            calls_completed: inner.calls_completed.load(Ordering::Relaxed),
            calls_failed: inner.calls_failed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("config", &self.inner.config)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl PoolInner {
    fn lock_idle(&self) -> MutexGuard<'_, Vec<PooledWorker>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_call(&self, success: bool) {
        if success {
            self.calls_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.calls_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn drive_call(
        self: Arc<Self>,
        correlation_id: Uuid,
        context: ExecutionContext,
        method: String,
        args: Vec<JsonValue>,
        kwargs: Map<String, JsonValue>,
        tx: UnboundedSender<Message>,
    ) {
        let plugin_id = context.plugin_id();
        let identity = context.reply_channel.to_string();
        let reply_channel = context.reply_channel;

        let Ok(_permit) = Arc::clone(&self.permits).acquire_owned().await else {
            self.fail_call(
                &tx,
                &plugin_id,
                &identity,
                "Process pool stopped before the call could run",
            );
            return;
        };

        let mut worker = match self.checkout().await {
            Ok(worker) => worker,
            Err(e) => {
                warn!(plugin_id = %plugin_id, error = %e, "No worker available for call");
                self.fail_call(&tx, &plugin_id, &identity, &format!("No worker available: {}", e));
                return;
            }
        };

        debug!(
            worker_id = %worker.id(),
            plugin_id = %plugin_id,
            %correlation_id,
            "Dispatching plugin call"
        );
        let request = WorkerMessage::ExecutePlugin {
            correlation_id,
            context,
            method,
            args,
            kwargs,
        };

        let call = exchange(&mut worker, request, correlation_id, reply_channel, &tx);
        let outcome = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => Err(format!("Call to {} timed out after {:?}", plugin_id, limit)),
            },
            None => call.await,
        };

        match outcome {
            Ok(success) => {
                worker.record_call();
                self.record_call(success);
                self.checkin(worker).await;
            }
            Err(reason) => {
                warn!(
                    worker_id = %worker.id(),
                    plugin_id = %plugin_id,
                    reason = %reason,
                    "Worker failed mid-call"
                );
                self.fail_call(&tx, &plugin_id, &identity, &reason);
                self.workers_discarded.fetch_add(1, Ordering::Relaxed);
                worker.kill().await;
            }
        }
    }

    async fn checkout(&self) -> ExecutionResult<PooledWorker> {
        let idle = self.lock_idle().pop();
        if let Some(worker) = idle {
            return Ok(worker);
        }
        let id = format!("worker-{}", self.next_worker.fetch_add(1, Ordering::Relaxed));
        let worker = self.spawner.spawn(&id).await?;
        self.workers_spawned.fetch_add(1, Ordering::Relaxed);
        Ok(worker)
    }

    async fn checkin(&self, worker: PooledWorker) {
        let retire = self
            .config
            .refresh_after_tasks
            .is_some_and(|limit| worker.calls_served() >= limit);

        let worker = if retire {
            debug!(worker_id = %worker.id(), calls = worker.calls_served(), "Recycling worker");
            Some(worker)
        } else {
            let mut idle = self.lock_idle();
            if self.stopped.load(Ordering::SeqCst) {
                Some(worker)
            } else {
                idle.push(worker);
                None
            }
        };

        if let Some(worker) = worker {
            worker.shutdown().await;
            self.workers_retired.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn fail_call(
        &self,
        tx: &UnboundedSender<Message>,
        plugin_id: &str,
        identity: &str,
        reason: &str,
    ) {
        self.record_call(false);
        let _ = tx.send(Message::error(LogRecord::new(
            plugin_id,
            identity,
            reason,
            LogRecord::STANDARD,
        )));
        let _ = tx.send(Message::ack());
    }
}

/// Send one request and forward its replies until the Ack.
///
/// Returns whether the plugin succeeded, or why the worker became unusable.
async fn exchange(
    worker: &mut PooledWorker,
    request: WorkerMessage,
    correlation_id: Uuid,
    reply_channel: ReplyChannel,
    tx: &UnboundedSender<Message>,
) -> Result<bool, String> {
    worker
        .send(request)
        .await
        .map_err(|e| format!("Worker {} unreachable: {}", worker.id(), e))?;

    let mut failed = false;
    loop {
        let reply = worker
            .receive()
            .await
            .map_err(|e| format!("Worker {} lost: {}", worker.id(), e))?;

        match reply {
            CoordinatorMessage::Emit {
                correlation_id: id,
                reply_channel: channel,
                message,
            } if id == correlation_id && channel == reply_channel => {
                let is_ack = message.is_ack();
                failed |= message.is_control(ControlCode::Error);
                let _ = tx.send(message);
                if is_ack {
                    return Ok(!failed);
                }
            }
            CoordinatorMessage::Emit { correlation_id: id, .. } => {
                warn!(worker_id = %worker.id(), stale = %id, "Dropping reply for another call");
            }
            CoordinatorMessage::Error { error, .. } => {
                warn!(worker_id = %worker.id(), error = %error, "Worker reported an error");
                failed = true;
            }
            CoordinatorMessage::Ready { .. } | CoordinatorMessage::Pong { .. } => {}
        }
    }
}
