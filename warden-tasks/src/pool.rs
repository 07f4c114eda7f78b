//! Persistent worker threads fed by a dispatcher thread

use crate::batch::{expand, Arg, BatchResult, TaskError, TaskFailure};
use crate::error::{TaskPoolError, TaskPoolResult};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};
use warden_config::TaskPoolConfig;

/// Pool size used by [`run`] callers that have no configuration at hand
pub const DEFAULT_POOL_SIZE: usize = 4;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Thread state, created on the first batch
struct Threads {
    submit: Sender<Job>,
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct PoolState {
    threads: Option<Threads>,
    stopped: bool,
}

/// A bounded pool of reusable worker threads.
///
/// Threads are spawned once, on the first call to [`TaskPool::run`], and
/// reused by every later batch. Several threads may run batches on the same
/// pool at once. After [`TaskPool::stop`] the pool refuses new batches.
pub struct TaskPool {
    pool_size: usize,
    state: Mutex<PoolState>,
}

impl TaskPool {
    pub fn new(pool_size: usize) -> TaskPoolResult<Self> {
        if pool_size == 0 {
            return Err(TaskPoolError::InvalidArguments(
                "pool size must be greater than zero".into(),
            ));
        }
        Ok(Self {
            pool_size,
            state: Mutex::new(PoolState::default()),
        })
    }

    pub fn from_config(config: &TaskPoolConfig) -> TaskPoolResult<Self> {
        Self::new(config.pool_size)
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn is_stopped(&self) -> bool {
        self.lock_state().stopped
    }

    /// Run `f` once per expanded argument tuple and wait for all of them.
    ///
    /// `results[i]` holds `f(args_i)` or `None` when that call failed,
    /// panicked or never ran; the cause of each `None` is in `failures`.
    pub fn run<T, R, E, F>(&self, f: F, args: Vec<Arg<T>>) -> TaskPoolResult<BatchResult<R, E>>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
        F: Fn(&[T]) -> Result<R, E> + Send + Sync + 'static,
    {
        let calls = expand(&args)?;
        let submit = self.submitter()?;
        let len = calls.len();
        let f = Arc::new(f);

        debug!(tasks = len, pool_size = self.pool_size, "Running task batch");

        let (done_tx, done_rx) = mpsc::channel::<(usize, Result<R, TaskError<E>>)>();
        for (index, call_args) in calls.into_iter().enumerate() {
            let f = Arc::clone(&f);
            let done = done_tx.clone();
            let job: Job = Box::new(move || {
                let outcome = match catch_unwind(AssertUnwindSafe(|| f(&call_args))) {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(TaskError::Failed(e)),
                    Err(panic) => Err(TaskError::Panicked(panic_message(panic.as_ref()))),
                };
                let _ = done.send((index, outcome));
            });
            if submit.send(job).is_err() {
                // The dispatcher is gone; the remaining slots stay abandoned.
                warn!(index, "Task pool dispatcher exited mid-batch");
                break;
            }
        }
        drop(done_tx);

        let mut results: Vec<Option<R>> = (0..len).map(|_| None).collect();
        let mut errors: Vec<Option<TaskError<E>>> = (0..len).map(|_| None).collect();
        let mut received = vec![false; len];

        // Ends once every job has reported or been dropped unrun.
        for (index, outcome) in done_rx {
            received[index] = true;
            match outcome {
                Ok(value) => results[index] = Some(value),
                Err(error) => errors[index] = Some(error),
            }
        }

        let failures: Vec<TaskFailure<E>> = errors
            .into_iter()
            .enumerate()
            .filter_map(|(index, error)| match error {
                Some(error) => Some(TaskFailure { index, error }),
                None if !received[index] => Some(TaskFailure {
                    index,
                    error: TaskError::Abandoned,
                }),
                None => None,
            })
            .collect();

        if !failures.is_empty() {
            debug!(failed = failures.len(), tasks = len, "Task batch finished with failures");
        }

        Ok(BatchResult { results, failures })
    }

    /// Signal and join every thread. Safe to call more than once.
    pub fn stop(&self) {
        let threads = {
            let mut state = self.lock_state();
            state.stopped = true;
            state.threads.take()
        };

        let Some(threads) = threads else {
            return;
        };

        // Closing the submit channel ends the dispatcher, which drops the
        // per-worker job channels and so ends every worker.
        drop(threads.submit);
        if threads.dispatcher.join().is_err() {
            warn!("Task pool dispatcher panicked");
        }
        for worker in threads.workers {
            if worker.join().is_err() {
                warn!("Task pool worker panicked");
            }
        }
        debug!("Task pool stopped");
    }

    fn submitter(&self) -> TaskPoolResult<Sender<Job>> {
        let mut state = self.lock_state();
        if state.stopped {
            return Err(TaskPoolError::PoolShutdown);
        }
        if state.threads.is_none() {
            state.threads = Some(spawn_threads(self.pool_size)?);
        }
        match &state.threads {
            Some(threads) => Ok(threads.submit.clone()),
            None => Err(TaskPoolError::PoolShutdown),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("pool_size", &self.pool_size)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Run a single batch on a temporary pool of `pool_size` threads.
pub fn run<T, R, E, F>(
    f: F,
    args: Vec<Arg<T>>,
    pool_size: usize,
) -> TaskPoolResult<BatchResult<R, E>>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
    F: Fn(&[T]) -> Result<R, E> + Send + Sync + 'static,
{
    let pool = TaskPool::new(pool_size)?;
    let result = pool.run(f, args);
    pool.stop();
    result
}

fn spawn_threads(pool_size: usize) -> TaskPoolResult<Threads> {
    let (idle_tx, idle_rx) = mpsc::channel::<usize>();
    let mut job_senders = Vec::with_capacity(pool_size);
    let mut workers = Vec::with_capacity(pool_size);

    for id in 0..pool_size {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let idle = idle_tx.clone();
        let name = format!("warden-task-{}", id);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(id, idle, job_rx))
            .map_err(|source| TaskPoolError::ThreadSpawnFailed { name, source })?;
        job_senders.push(job_tx);
        workers.push(handle);
    }
    drop(idle_tx);

    let (submit, submit_rx) = mpsc::channel::<Job>();
    let name = "warden-task-dispatch".to_string();
    let dispatcher = thread::Builder::new()
        .name(name.clone())
        .spawn(move || dispatch_loop(submit_rx, idle_rx, job_senders))
        .map_err(|source| TaskPoolError::ThreadSpawnFailed { name, source })?;

    debug!(pool_size, "Task pool threads started");
    Ok(Threads {
        submit,
        dispatcher,
        workers,
    })
}

/// Hand each submitted job to the next worker that reports itself idle
fn dispatch_loop(submit: Receiver<Job>, idle: Receiver<usize>, workers: Vec<Sender<Job>>) {
    for job in submit {
        let Ok(id) = idle.recv() else {
            warn!("No task pool workers left");
            return;
        };
        if workers[id].send(job).is_err() {
            warn!(worker = id, "Task pool worker exited");
        }
    }
}

fn worker_loop(id: usize, idle: Sender<usize>, jobs: Receiver<Job>) {
    loop {
        if idle.send(id).is_err() {
            return;
        }
        match jobs.recv() {
            Ok(job) => {
                trace!(worker = id, "Running task");
                job();
            }
            Err(_) => return,
        }
    }
}

/// Text of a caught panic payload
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
