//! Bridge server process: child side and parent side
//!
//! The parent starts the server as a child process and talks to it over the
//! child's stdin/stdout. The child binds its RPC listener first and reports
//! the outcome as the first packet it writes: `("ok", address)` or
//! `("fail", error)`. After that, RPC requests become bridge calls to the
//! parent, and the parent's events are forwarded to the push sink.

use crate::bridge::Bridge;
use crate::error::{BridgeError, BridgeResult, RemoteError};
use crate::packet::{Packet, PacketReader, PacketWriter, FAIL, OK};
use crate::push::PushSink;
use crate::rpc::rpc_router;
use crate::service::{CommandHandler, CommandServer, Outbox};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use warden_config::BridgeConfig;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Run the bridge server on `input`/`output` until the parent stops it
pub async fn run_bridge_server<R, W>(config: &BridgeConfig, input: R, output: W) -> BridgeResult<()>
where
    R: AsyncBufRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let sink = match &config.push_url {
        Some(url) => match PushSink::new(url, config.push_timeout) {
            Ok(sink) => Some(sink),
            Err(e) => return report_failure(output, e.to_string()).await,
        },
        None => None,
    };

    let bind = config.bind_address();
    let listener = match TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(e) => return report_failure(output, format!("cannot bind {}: {}", bind, e)).await,
    };
    let address = listener.local_addr()?.to_string();

    let bridge = Bridge::new(input, output, move |packet: Packet| {
        debug!(command = %packet.command, "Bridge event");
        if let Some(sink) = &sink {
            sink.push_packet(packet);
        }
    });
    bridge.handshake(&address).await?;
    info!(%address, path = %config.rpc_path, "Bridge server listening");

    let app = rpc_router(bridge.clone(), &config.rpc_path);
    let closed = {
        let bridge = bridge.clone();
        async move { bridge.closed().await }
    };
    let served = axum::serve(listener, app).with_graceful_shutdown(closed).await;

    bridge.close().await;
    served?;
    info!("Bridge server stopped");
    Ok(())
}

async fn report_failure<W>(output: W, message: String) -> BridgeResult<()>
where
    W: AsyncWrite + Send + Unpin,
{
    error!(error = %message, "Bridge server cannot start");
    let mut writer = PacketWriter::new(output);
    let _ = writer
        .write_packet(&Packet::fail(&RemoteError::new("bootstrap_failed", message.clone())), None)
        .await;
    let _ = writer.close().await;
    Err(BridgeError::BootstrapFailed(message))
}

/// A started bridge server child, before its command service runs
pub struct BridgeLink {
    pub reader: PacketReader<BufReader<ChildStdout>>,
    pub writer: PacketWriter<ChildStdin>,
    pub child: Child,
    /// Address the child's RPC endpoint listens on
    pub addr: String,
}

/// Start the bridge server child and wait for its status packet.
///
/// The child is the configured server program, or the running executable,
/// started in hidden `--bridge-server` mode.
pub async fn launch_server(config: &BridgeConfig) -> BridgeResult<BridgeLink> {
    let program = match &config.server_program {
        Some(program) => program.clone(),
        None => std::env::current_exe()?,
    };
    let encoded = serde_json::to_string(config).map_err(|e| BridgeError::Codec(e.to_string()))?;

    let mut child = Command::new(&program)
        .arg("--bridge-server")
        .arg("--bridge-config")
        .arg(encoded)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BridgeError::BootstrapFailed(format!("{}: {}", program.display(), e)))?;

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        let _ = child.kill().await;
        return Err(BridgeError::BootstrapFailed(
            "bridge server pipes unavailable".to_string(),
        ));
    };

    let mut reader = PacketReader::new(BufReader::new(stdout));
    let outcome = match reader.read_packet(Some(config.bootstrap_timeout)).await {
        Ok(packet) if packet.command == OK => match packet.args.first().and_then(|a| a.as_str()) {
            Some(addr) => Ok(addr.to_string()),
            None => Err(BridgeError::BootstrapFailed(
                "bridge server did not report its address".to_string(),
            )),
        },
        Ok(packet) if packet.command == FAIL => Err(BridgeError::BootstrapFailed(
            RemoteError::from_payload(packet.args.first()).message,
        )),
        Ok(packet) => Err(BridgeError::BootstrapFailed(format!(
            "unexpected first packet '{}'",
            packet.command
        ))),
        Err(BridgeError::Timeout(_)) => {
            Err(BridgeError::BootstrapTimeout(config.bootstrap_timeout))
        }
        Err(e) => Err(BridgeError::BootstrapFailed(e.to_string())),
    };

    match outcome {
        Ok(addr) => {
            info!(%addr, pid = ?child.id(), "Bridge server started");
            Ok(BridgeLink {
                reader,
                writer: PacketWriter::new(stdin),
                child,
                addr,
            })
        }
        Err(e) => {
            error!(error = %e, "Bridge server failed to start");
            let _ = child.kill().await;
            Err(e)
        }
    }
}

impl BridgeLink {
    /// Start answering the child's calls with `handler`
    pub fn serve(self, handler: Arc<dyn CommandHandler>) -> ServedBridge {
        let (outbox, writer) = Outbox::spawn(self.writer);
        let service = tokio::spawn(CommandServer::run(self.reader, outbox.clone(), handler));
        ServedBridge {
            outbox,
            addr: self.addr,
            child: self.child,
            service: Some(service),
            writer,
        }
    }
}

/// A bridge server child whose calls are being served
pub struct ServedBridge {
    outbox: Outbox,
    addr: String,
    child: Child,
    service: Option<JoinHandle<BridgeResult<()>>>,
    writer: JoinHandle<BridgeResult<()>>,
}

impl ServedBridge {
    /// Packets queued here reach the child as events
    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Wait for the command service to end: the child stopped, closed its
    /// pipe or reported a failure
    pub async fn finished(&mut self) -> BridgeResult<()> {
        let Some(service) = self.service.as_mut() else {
            return Ok(());
        };
        let outcome = service.await;
        self.service = None;
        match outcome {
            Ok(result) => result,
            Err(e) => Err(BridgeError::PeerFailed(format!("command service ended: {}", e))),
        }
    }

    /// Stop the child and wait for it to exit, killing it if it lingers
    pub async fn shutdown(mut self) {
        self.outbox.stop();
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut self.writer).await {
            Ok(Ok(Err(e))) => debug!(error = %e, "Bridge writer ended with error"),
            Err(_) => self.writer.abort(),
            _ => {}
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => info!(%status, "Bridge server exited"),
            Ok(Err(e)) => warn!(error = %e, "Failed to wait for bridge server"),
            Err(_) => {
                warn!("Bridge server did not exit in time, killing it");
                let _ = self.child.kill().await;
            }
        }

        if let Some(service) = self.service.take() {
            service.abort();
        }
    }
}

impl std::fmt::Debug for ServedBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServedBridge")
            .field("addr", &self.addr)
            .field("pid", &self.child.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_bind_failure_is_reported_before_anything_else() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = BridgeConfig {
            listen_address: "127.0.0.1".to_string(),
            listen_port: taken.local_addr().unwrap().port(),
            ..BridgeConfig::default()
        };

        let (_input_write, input_read) = duplex(1024);
        let (output_write, output_read) = duplex(1024);
        let err = run_bridge_server(&config, BufReader::new(input_read), output_write)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::BootstrapFailed(_)));

        let mut reader = PacketReader::new(BufReader::new(output_read));
        let status = reader.read_packet(None).await.unwrap();
        assert_eq!(status.command, FAIL);
        assert_eq!(
            RemoteError::from_payload(status.args.first()).kind,
            "bootstrap_failed"
        );
    }

    #[tokio::test]
    async fn test_launch_reports_spawn_failure() {
        let config = BridgeConfig {
            server_program: Some("/nonexistent/warden-bridge-server".into()),
            ..BridgeConfig::default()
        };
        assert!(matches!(
            launch_server(&config).await,
            Err(BridgeError::BootstrapFailed(_))
        ));
    }
}
