//! The worker side of the process pool

use crate::bootstrap::invoke_plugin;
use crate::error::ExecutionError;
use crate::plugin::PluginRegistry;
use crate::proxy::ReplyProxy;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use warden_ipc::{
    CoordinatorMessage, IpcError, LineTransport, LineWriter, MessageEnvelope, WorkerError,
    WorkerMessage, WorkerStatus,
};
use warden_messaging::{LogRecord, Message};

/// Serve plugin calls over `transport` until told to shut down.
///
/// Announces itself with `Ready`, then handles one request at a time.
/// Messages a plugin emits are written as they are produced. The loop ends
/// on `Shutdown`, at end of input, or on an unrecoverable transport error.
pub async fn run_worker<R, W>(
    worker_id: String,
    transport: LineTransport<R, W>,
    registry: Arc<PluginRegistry>,
) -> Result<(), ExecutionError>
where
    R: AsyncBufRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    let pid = std::process::id();
    let mut status = WorkerStatus::new(worker_id.clone(), pid);
    let (mut reader, mut writer) = transport.into_split();

    info!(worker_id = %worker_id, pid, "Worker starting");
    writer
        .send(&MessageEnvelope::new(CoordinatorMessage::Ready {
            worker_id: worker_id.clone(),
            pid,
        }))
        .await?;

    loop {
        let envelope = match reader.receive::<WorkerMessage>().await {
            Ok(envelope) => envelope,
            Err(IpcError::ConnectionClosed) => {
                info!(worker_id = %worker_id, "Worker received EOF, shutting down");
                break;
            }
            Err(IpcError::DeserializationError(e)) => {
                error!(worker_id = %worker_id, error = %e, "Failed to parse worker message");
                send_worker_error(&mut writer, WorkerError::MessageParseError { error: e }).await?;
                continue;
            }
            Err(e @ IpcError::ProtocolVersionMismatch { .. }) => {
                error!(
                    worker_id = %worker_id,
                    error = %e,
                    "Rejected message from another protocol version"
                );
                send_worker_error(
                    &mut writer,
                    WorkerError::CommunicationError {
                        error: e.to_string(),
                    },
                )
                .await?;
                continue;
            }
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "Worker transport failed");
                break;
            }
        };

        match envelope.message {
            WorkerMessage::ExecutePlugin {
                correlation_id,
                context,
                method,
                args,
                kwargs,
            } => {
                let reply_channel = context.reply_channel;
                let plugin_id = context.plugin_id();
                let (proxy, mut replies) =
                    ReplyProxy::channel(plugin_id.clone(), reply_channel.to_string());

                let registry = Arc::clone(&registry);
                let call = tokio::task::spawn_blocking(move || {
                    invoke_plugin(&registry, &context, &method, &args, &kwargs, proxy)
                });

                let mut acked = false;
                while let Some(message) = replies.recv().await {
                    let is_ack = message.is_ack();
                    writer
                        .send(&MessageEnvelope::new(CoordinatorMessage::Emit {
                            correlation_id,
                            reply_channel,
                            message,
                        }))
                        .await?;
                    if is_ack {
                        acked = true;
                        break;
                    }
                }

                let success = match call.await {
                    Ok(success) => success,
                    Err(e) => {
                        warn!(worker_id = %worker_id, error = %e, "Plugin task did not complete");
                        false
                    }
                };

                if !acked {
                    // The call died before acknowledging; close it out here.
                    let identity = reply_channel.to_string();
                    for message in [
                        Message::error(LogRecord::new(
                            plugin_id.as_str(),
                            identity,
                            format!("Plugin {} ended without acknowledging", plugin_id),
                            LogRecord::STANDARD,
                        )),
                        Message::ack(),
                    ] {
                        writer
                            .send(&MessageEnvelope::new(CoordinatorMessage::Emit {
                                correlation_id,
                                reply_channel,
                                message,
                            }))
                            .await?;
                    }
                }

                status.record_call(success && acked);
                debug!(
                    worker_id = %worker_id,
                    %correlation_id,
                    success,
                    "Worker finished plugin call"
                );
            }
            WorkerMessage::Ping { correlation_id } => {
                writer
                    .send(&MessageEnvelope::new(CoordinatorMessage::Pong {
                        correlation_id,
                        status: status.clone(),
                    }))
                    .await?;
            }
            WorkerMessage::Shutdown => {
                info!(worker_id = %worker_id, "Worker received shutdown");
                break;
            }
        }
    }

    let _ = writer.close().await;
    info!(
        worker_id = %worker_id,
        calls = status.calls_served,
        failed = status.calls_failed,
        "Worker shutting down"
    );
    Ok(())
}

async fn send_worker_error<W>(
    writer: &mut LineWriter<W>,
    error: WorkerError,
) -> Result<(), ExecutionError>
where
    W: AsyncWrite + Send + Unpin,
{
    writer
        .send(&MessageEnvelope::new(CoordinatorMessage::Error {
            correlation_id: None::<Uuid>,
            error,
        }))
        .await
        .map_err(ExecutionError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use std::collections::BTreeMap;
    use tokio::io::{duplex, AsyncWriteExt, BufReader};
    use warden_ipc::{BoxedTransport, ExecutionContext, IpcTransport};
    use warden_messaging::ControlCode;

    fn start_worker() -> (BoxedTransport, tokio::task::JoinHandle<Result<(), ExecutionError>>) {
        let (coord_write, worker_read) = duplex(64 * 1024);
        let (worker_write, coord_read) = duplex(64 * 1024);
        let worker = BoxedTransport::boxed(BufReader::new(worker_read), worker_write);
        let handle = tokio::spawn(run_worker(
            "w-test".to_string(),
            worker,
            Arc::new(crate::plugin::PluginRegistry::with_builtins()),
        ));
        (BoxedTransport::boxed(BufReader::new(coord_read), coord_write), handle)
    }

    async fn execute(coordinator: &mut BoxedTransport, method: &str) -> Vec<Message> {
        let correlation_id = Uuid::new_v4();
        let context =
            ExecutionContext::for_plugin("builtin:echo", "audit", BTreeMap::new()).unwrap();
        coordinator
            .send(&MessageEnvelope::new(WorkerMessage::ExecutePlugin {
                correlation_id,
                context,
                method: method.to_string(),
                args: vec![json!("abc")],
                kwargs: Map::new(),
            }))
            .await
            .unwrap();

        let mut messages = Vec::new();
        loop {
            match coordinator.receive::<CoordinatorMessage>().await.unwrap().message {
                CoordinatorMessage::Emit {
                    correlation_id: id,
                    message,
                    ..
                } => {
                    assert_eq!(id, correlation_id);
                    let done = message.is_ack();
                    messages.push(message);
                    if done {
                        return messages;
                    }
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_survives_failing_call() {
        let (mut coordinator, handle) = start_worker();

        let ready = coordinator.receive::<CoordinatorMessage>().await.unwrap();
        assert!(matches!(
            ready.message,
            CoordinatorMessage::Ready { ref worker_id, .. } if worker_id == "w-test"
        ));

        let failed = execute(&mut coordinator, "fail").await;
        assert!(failed.iter().any(|m| m.is_control(ControlCode::Error)));
        assert_eq!(failed.iter().filter(|m| m.is_ack()).count(), 1);

        let ok = execute(&mut coordinator, "run").await;
        assert!(ok.iter().any(|m| m.payload() == &json!("abc")));

        coordinator
            .send(&MessageEnvelope::new(WorkerMessage::Ping {
                correlation_id: Uuid::new_v4(),
            }))
            .await
            .unwrap();
        match coordinator.receive::<CoordinatorMessage>().await.unwrap().message {
            CoordinatorMessage::Pong { status, .. } => {
                assert_eq!(status.calls_served, 2);
                assert_eq!(status.calls_failed, 1);
            }
            other => panic!("unexpected message: {:?}", other),
        }

        coordinator
            .send(&MessageEnvelope::new(WorkerMessage::Shutdown))
            .await
            .unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_garbage_input_is_reported_not_fatal() {
        let (coord_write, worker_read) = duplex(4096);
        let (worker_write, coord_read) = duplex(4096);
        let handle = tokio::spawn(run_worker(
            "w-garbage".to_string(),
            BoxedTransport::boxed(BufReader::new(worker_read), worker_write),
            Arc::new(crate::plugin::PluginRegistry::with_builtins()),
        ));
        let mut reader = warden_ipc::LineReader::new(BufReader::new(coord_read));
        let mut raw = coord_write;

        assert!(matches!(
            reader.receive::<CoordinatorMessage>().await.unwrap().message,
            CoordinatorMessage::Ready { .. }
        ));

        raw.write_all(b"not json\n").await.unwrap();
        assert!(matches!(
            reader.receive::<CoordinatorMessage>().await.unwrap().message,
            CoordinatorMessage::Error {
                error: WorkerError::MessageParseError { .. },
                ..
            }
        ));

        drop(raw);
        handle.await.unwrap().unwrap();
    }
}
