use async_trait::async_trait;
use serde_json::{json, Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use warden_config::ProcessPoolConfig;
use warden_execution::{
    ExecutionError, ExecutionResult, LocalSpawner, Plugin, PluginError, PluginRegistry,
    PooledWorker, ProcessPool, ReplyProxy, WorkerSpawner,
};
use warden_ipc::{
    BoxedTransport, CoordinatorMessage, ExecutionContext, MessageEnvelope, WorkerMessage,
};
use warden_messaging::{ControlCode, InfoCode, Message, MessageCode, StateCode};

fn pool_config(workers: usize) -> ProcessPoolConfig {
    ProcessPoolConfig {
        worker_count: workers,
        ..ProcessPoolConfig::default()
    }
}

fn context(plugin_id: &str) -> ExecutionContext {
    ExecutionContext::for_plugin(plugin_id, "nightly", BTreeMap::new()).unwrap()
}

fn local_pool(config: ProcessPoolConfig, registry: PluginRegistry) -> ProcessPool {
    let registry = Arc::new(registry);
    let spawner = Arc::new(LocalSpawner::new(Arc::clone(&registry)));
    ProcessPool::new(config, registry, spawner)
}

/// Wait for background call tasks to hand their workers back
async fn settle(pool: &ProcessPool) {
    for _ in 0..200 {
        if pool.stats().busy_workers == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pool did not settle: {:?}", pool.stats());
}

fn infos(messages: &[Message]) -> Vec<JsonValue> {
    messages
        .iter()
        .filter(|m| m.code() == MessageCode::Info(InfoCode::Data))
        .map(|m| m.payload().clone())
        .collect()
}

/// Blocks until released, after reporting some progress
struct Gate {
    proxy: Option<ReplyProxy>,
    released: Arc<AtomicBool>,
}

impl Plugin for Gate {
    fn attach(&mut self, proxy: ReplyProxy) {
        self.proxy = Some(proxy);
    }

    fn invoke(
        &mut self,
        _method: &str,
        _args: &[JsonValue],
        _kwargs: &Map<String, JsonValue>,
    ) -> Result<Vec<JsonValue>, PluginError> {
        if let Some(proxy) = &self.proxy {
            proxy.progress(50.0);
        }
        while !self.released.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(vec![json!("released")])
    }
}

struct Sleeper;

impl Plugin for Sleeper {
    fn attach(&mut self, _proxy: ReplyProxy) {}

    fn invoke(
        &mut self,
        _method: &str,
        _args: &[JsonValue],
        _kwargs: &Map<String, JsonValue>,
    ) -> Result<Vec<JsonValue>, PluginError> {
        std::thread::sleep(Duration::from_millis(800));
        Ok(vec![])
    }
}

#[tokio::test]
async fn test_in_process_mode_runs_inline() {
    let pool = local_pool(ProcessPoolConfig::in_process(), PluginRegistry::with_builtins());

    let messages = pool
        .execute(context("builtin:echo"), "run", vec![json!("abc")], Map::new())
        .await
        .unwrap();

    assert_eq!(infos(&messages), vec![json!("abc")]);
    assert!(messages.last().unwrap().is_ack());
    assert!(messages.iter().all(|m| m.audit_id() == Some("nightly")));

    let stats = pool.stats();
    assert!(stats.in_process);
    assert_eq!(stats.workers_spawned, 0);
    assert_eq!(stats.calls_completed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_is_reused_and_survives_failures() {
    let pool = local_pool(pool_config(1), PluginRegistry::with_builtins());

    let failed = pool
        .execute(context("builtin:echo"), "fail", vec![], Map::new())
        .await
        .unwrap();
    assert_eq!(failed.iter().filter(|m| m.is_control(ControlCode::Error)).count(), 1);
    assert_eq!(failed.iter().filter(|m| m.is_ack()).count(), 1);

    let panicked = pool
        .execute(context("builtin:echo"), "panic", vec![], Map::new())
        .await
        .unwrap();
    assert!(panicked.iter().any(|m| m.is_control(ControlCode::Error)));

    let ok = pool
        .execute(context("builtin:echo"), "run", vec![json!(1), json!(2)], Map::new())
        .await
        .unwrap();
    assert_eq!(infos(&ok), vec![json!(1), json!(2)]);

    settle(&pool).await;
    let stats = pool.stats();
    assert_eq!(stats.workers_spawned, 1);
    assert_eq!(stats.workers_discarded, 0);
    assert_eq!(stats.calls_failed, 2);
    assert_eq!(stats.calls_completed, 1);
    pool.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_are_recycled() {
    let config = ProcessPoolConfig {
        worker_count: 1,
        refresh_after_tasks: Some(2),
        ..ProcessPoolConfig::default()
    };
    let pool = local_pool(config, PluginRegistry::with_builtins());

    for i in 0..5 {
        let messages = pool
            .execute(context("builtin:echo"), "run", vec![json!(i)], Map::new())
            .await
            .unwrap();
        assert_eq!(infos(&messages), vec![json!(i)]);
    }

    settle(&pool).await;
    let stats = pool.stats();
    assert_eq!(stats.workers_spawned, 3);
    assert_eq!(stats.workers_retired, 2);
    assert_eq!(stats.idle_workers, 1);
    pool.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_messages_are_streamed_before_the_call_ends() {
    let released = Arc::new(AtomicBool::new(false));
    let mut registry = PluginRegistry::new();
    let gate = Arc::clone(&released);
    registry
        .register("test:Gate", "blocks until released", move || {
            Box::new(Gate {
                proxy: None,
                released: Arc::clone(&gate),
            })
        })
        .unwrap();
    let pool = local_pool(pool_config(1), registry);

    let mut handle = pool
        .submit(context("test:Gate"), "run", vec![], Map::new())
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), handle.next())
        .await
        .unwrap()
        .unwrap();
    assert!(first.is_state(StateCode::PluginStep));
    assert_eq!(first.audit_id(), Some("nightly"));

    released.store(true, Ordering::SeqCst);
    let rest = handle.wait().await;
    assert_eq!(infos(&rest), vec![json!("released")]);
    assert!(rest.last().unwrap().is_ack());
    pool.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_is_bounded_by_worker_count() {
    let pool = local_pool(pool_config(2), PluginRegistry::with_builtins());

    let mut handles = Vec::new();
    for i in 0..6 {
        handles.push(
            pool.submit(context("builtin:echo"), "run", vec![json!(i)], Map::new())
                .await
                .unwrap(),
        );
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let messages = handle.wait().await;
        assert_eq!(infos(&messages), vec![json!(i)]);
    }

    settle(&pool).await;
    let stats = pool.stats();
    assert!(stats.workers_spawned <= 2);
    assert_eq!(stats.calls_completed, 6);
    pool.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_call_timeout_discards_worker() {
    let mut registry = PluginRegistry::new();
    registry.register("test:Sleeper", "", || Box::new(Sleeper)).unwrap();
    let config = ProcessPoolConfig {
        worker_count: 1,
        call_timeout: Some(Duration::from_millis(100)),
        ..ProcessPoolConfig::default()
    };
    let pool = local_pool(config, registry);

    let messages = pool
        .execute(context("test:Sleeper"), "run", vec![], Map::new())
        .await
        .unwrap();
    let error = messages
        .iter()
        .find(|m| m.is_control(ControlCode::Error))
        .unwrap();
    assert!(error.log_record().unwrap().text.contains("timed out"));
    assert!(messages.last().unwrap().is_ack());
    settle(&pool).await;
    assert_eq!(pool.stats().workers_discarded, 1);
}

/// Worker that announces itself, accepts one request and dies
struct CrashingSpawner;

#[async_trait]
impl WorkerSpawner for CrashingSpawner {
    async fn spawn(&self, worker_id: &str) -> ExecutionResult<PooledWorker> {
        let (coord_write, worker_read) = tokio::io::duplex(4096);
        let (worker_write, coord_read) = tokio::io::duplex(4096);
        let worker_side = BoxedTransport::boxed(BufReader::new(worker_read), worker_write);

        let id = worker_id.to_string();
        tokio::spawn(async move {
            let (mut reader, mut writer) = worker_side.into_split();
            let _ = writer
                .send(&MessageEnvelope::new(CoordinatorMessage::Ready {
                    worker_id: id,
                    pid: 0,
                }))
                .await;
            let _ = reader.receive::<WorkerMessage>().await;
        });

        PooledWorker::connect(
            worker_id,
            BoxedTransport::boxed(BufReader::new(coord_read), coord_write),
            Duration::from_secs(5),
        )
        .await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dead_worker_yields_error_and_ack() {
    let pool = ProcessPool::new(
        pool_config(1),
        Arc::new(PluginRegistry::with_builtins()),
        Arc::new(CrashingSpawner),
    );

    for _ in 0..2 {
        let messages = pool
            .execute(context("builtin:echo"), "run", vec![json!("x")], Map::new())
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].is_control(ControlCode::Error));
        assert!(messages[1].is_ack());
    }

    settle(&pool).await;
    let stats = pool.stats();
    assert_eq!(stats.workers_spawned, 2);
    assert_eq!(stats.workers_discarded, 2);
}

#[tokio::test]
async fn test_submit_after_stop_fails() {
    let pool = local_pool(pool_config(1), PluginRegistry::with_builtins());
    pool.stop().await;
    pool.stop().await;

    let err = pool
        .submit(context("builtin:echo"), "run", vec![], Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::PoolStopped));
}
