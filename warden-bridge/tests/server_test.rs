use axum::{extract::Path, extract::State, routing::post, Json, Router};
use serde_json::{json, Value as JsonValue};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use warden_audit::AuditOrchestrator;
use warden_bridge::{
    run_bridge_server, AuditCommands, BridgeError, CommandServer, EventNotifier, Outbox,
    PacketReader, PacketWriter, PushSink, RpcClient,
};
use warden_config::{AuditDefaults, BridgeConfig, ProcessPoolConfig};
use warden_execution::{LocalSpawner, PluginRegistry, ProcessPool};
use warden_messaging::{Dispatcher, Message};

type Captured = mpsc::UnboundedSender<(String, JsonValue)>;

/// HTTP server recording every POST to `/events/<command>`
async fn capture_server() -> (SocketAddr, mpsc::UnboundedReceiver<(String, JsonValue)>) {
    async fn record(
        State(tx): State<Captured>,
        Path(command): Path<String>,
        Json(body): Json<JsonValue>,
    ) -> Json<JsonValue> {
        let _ = tx.send((command, body));
        Json(json!({"ok": true}))
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/events/{command}", post(record))
        .with_state(tx);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, rx)
}

fn orchestrator() -> AuditOrchestrator {
    let registry = Arc::new(PluginRegistry::with_builtins());
    let spawner = Arc::new(LocalSpawner::new(Arc::clone(&registry)));
    let pool = ProcessPool::new(ProcessPoolConfig::in_process(), registry, spawner);
    AuditOrchestrator::new(Arc::new(Dispatcher::new()), pool, AuditDefaults::default())
}

fn remote_kind(result: Result<JsonValue, BridgeError>) -> String {
    match result {
        Err(BridgeError::Remote(error)) => error.kind,
        other => panic!("expected a remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_push_sink_posts_events() {
    let (addr, mut captured) = capture_server().await;
    let sink = PushSink::new(&format!("http://{}/events", addr), Duration::from_secs(5)).unwrap();

    sink.push("stage", vec![json!("nightly"), json!("start")]);
    let (command, body) = tokio::time::timeout(Duration::from_secs(5), captured.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(command, "stage");
    assert_eq!(body, json!(["nightly", "start"]));

    let dispatcher = Dispatcher::new();
    dispatcher.add_listener(Arc::new(sink));
    dispatcher.send_message(&Message::ack());
    dispatcher.send_message(
        &Message::stage(warden_messaging::AuditStage::Finish)
            .with_audit_id("nightly")
            .unwrap(),
    );
    let (command, body) = tokio::time::timeout(Duration::from_secs(5), captured.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(command, "stage");
    assert_eq!(body, json!(["nightly", "finish"]));
}

#[tokio::test]
async fn test_push_failures_are_not_raised() {
    // Nothing listens on port 9 of localhost.
    let sink = PushSink::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
    sink.push("log", vec![json!("x")]);
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bridge_server_end_to_end() {
    let (push_addr, mut pushed) = capture_server().await;
    let config = BridgeConfig {
        enabled: true,
        listen_address: "127.0.0.1".to_string(),
        listen_port: 0,
        push_url: Some(format!("http://{}/events", push_addr)),
        ..BridgeConfig::default()
    };

    // Orchestrator side writes to the server's input and reads its output.
    let (parent_write, server_read) = duplex(64 * 1024);
    let (server_write, parent_read) = duplex(64 * 1024);
    let server = tokio::spawn({
        let config = config.clone();
        async move { run_bridge_server(&config, BufReader::new(server_read), server_write).await }
    });

    let mut reader = PacketReader::new(BufReader::new(parent_read));
    let status = reader.read_packet(Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(status.command, "ok");
    let addr = status.args[0].as_str().unwrap().to_string();

    let orchestrator = orchestrator();
    let (outbox, _writer) = Outbox::spawn(PacketWriter::new(parent_write));
    orchestrator
        .dispatcher()
        .add_listener(Arc::new(EventNotifier::new(outbox.clone())));
    let service = tokio::spawn(CommandServer::run(
        reader,
        outbox.clone(),
        Arc::new(AuditCommands::new(orchestrator.clone())),
    ));

    let client = RpcClient::new(&format!("http://{}{}", addr, config.rpc_path)).unwrap();
    let name = client
        .call(
            "audit/create",
            vec![json!({"name": "nightly", "targets": ["10.0.0.1"], "plugins": ["builtin:echo"]})],
        )
        .await
        .unwrap();
    assert_eq!(name, json!("nightly"));

    let mut state = JsonValue::Null;
    for _ in 0..300 {
        state = client.call("audit/state", vec![json!("nightly")]).await.unwrap();
        if state["state"] == json!("finished") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state["state"], json!("finished"));
    assert_eq!(state["stage"], json!("finish"));
    assert_eq!(state["pending"], json!(0));

    let ids = client.call("audit/results", vec![json!("nightly")]).await.unwrap();
    let ids = ids.as_array().unwrap().clone();
    assert_eq!(ids.len(), 1);
    let details = client
        .call("audit/details", vec![json!("nightly"), json!(ids)])
        .await
        .unwrap();
    let id = ids[0].as_str().unwrap();
    assert_eq!(details[id]["payload"], json!("10.0.0.1"));
    assert_eq!(details[id]["plugin_id"], json!("builtin:echo"));

    let log = client.call("audit/log", vec![json!("nightly")]).await.unwrap();
    assert_eq!(log[0][0], json!("builtin:echo"));

    let summary = client.call("audit/summary", vec![json!("nightly")]).await.unwrap();
    assert_eq!(summary["results"], json!(1));
    assert_eq!(summary["errors"], json!(0));

    let list = client.call("audit/list", vec![]).await.unwrap();
    assert_eq!(list["nightly"]["targets"], json!(["10.0.0.1"]));

    // Lifecycle errors keep their kind across both hops.
    let duplicate = client
        .call(
            "audit/create",
            vec![json!({"name": "nightly", "targets": ["x"], "plugins": []})],
        )
        .await;
    assert_eq!(remote_kind(duplicate), "already_exists");
    assert_eq!(
        remote_kind(client.call("audit/state", vec![json!("missing")]).await),
        "not_found"
    );
    assert_eq!(
        remote_kind(client.call("audit/pause", vec![json!("nightly")]).await),
        "invalid_state"
    );
    assert_eq!(
        remote_kind(client.call("audit/frobnicate", vec![]).await),
        "not_implemented"
    );

    // Status codes follow the error kind.
    let response = reqwest::Client::new()
        .post(format!("http://{}{}", addr, config.rpc_path))
        .json(&json!({"command": "audit/state", "args": ["missing"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);

    // Audit events reach the push sink through the server.
    let mut stages = Vec::new();
    while stages.len() < 2 {
        let (command, body) = tokio::time::timeout(Duration::from_secs(5), pushed.recv())
            .await
            .unwrap()
            .unwrap();
        if command == "stage" {
            stages.push(body[1].clone());
        }
    }
    // Pushes are sent concurrently, so arrival order is not fixed.
    stages.sort_by_key(|s| s.to_string());
    assert_eq!(stages, vec![json!("finish"), json!("start")]);

    client.call("audit/delete", vec![json!("nightly")]).await.unwrap();
    assert!(!orchestrator.has_audits());

    // Stopping the server ends both sides.
    outbox.stop();
    let served = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert!(served.is_ok());
    let service = tokio::time::timeout(Duration::from_secs(5), service)
        .await
        .unwrap()
        .unwrap();
    assert!(service.is_ok());
}
