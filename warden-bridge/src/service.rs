//! Serving calls that arrive over the bridge

use crate::error::{BridgeError, BridgeResult, RemoteError};
use crate::packet::{Packet, PacketReader, PacketWriter, FAIL, OK, STOP};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Answers commands received over the bridge
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &str, args: Vec<JsonValue>) -> Result<JsonValue, RemoteError>;
}

/// Collapse repeated slashes and trim leading and trailing ones
pub fn normalize_command(command: &str) -> String {
    command
        .split('/')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Queue of packets for a single writer task.
///
/// Replies and events from any number of producers are written in the
/// order they were queued.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Packet>,
}

impl Outbox {
    /// Start the writer task. It ends after writing `stop`, or once every
    /// `Outbox` clone is gone.
    pub fn spawn<W>(mut writer: PacketWriter<W>) -> (Self, JoinHandle<BridgeResult<()>>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
        let task = tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                let stop = packet.command == STOP;
                writer.write_packet(&packet, None).await?;
                if stop {
                    break;
                }
            }
            writer.close().await
        });
        (Self { tx }, task)
    }

    pub fn send(&self, packet: Packet) -> BridgeResult<()> {
        self.tx.send(packet).map_err(|_| BridgeError::Closed)
    }

    /// Ask the peer's reader to exit; nothing is written afterwards
    pub fn stop(&self) {
        let _ = self.send(Packet::stop());
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Reads calls off the bridge and answers them in arrival order
pub struct CommandServer;

impl CommandServer {
    /// Serve until the peer sends `stop` or closes the pipe.
    ///
    /// A `fail` packet from the peer means it could not keep running and
    /// ends the loop with [`BridgeError::PeerFailed`].
    pub async fn run<R>(
        mut reader: PacketReader<R>,
        outbox: Outbox,
        handler: Arc<dyn CommandHandler>,
    ) -> BridgeResult<()>
    where
        R: AsyncBufRead + Send + Unpin,
    {
        loop {
            let packet = match reader.read_packet(None).await {
                Ok(packet) => packet,
                Err(BridgeError::Closed) => {
                    info!("Bridge peer went away");
                    return Ok(());
                }
                Err(BridgeError::Codec(e)) => {
                    warn!(error = %e, "Skipping malformed packet");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Bridge read failed");
                    continue;
                }
            };

            match packet.command.as_str() {
                STOP => {
                    info!("Bridge peer stopped");
                    return Ok(());
                }
                FAIL => {
                    let error = RemoteError::from_payload(packet.args.first());
                    return Err(BridgeError::PeerFailed(error.to_string()));
                }
                OK => {
                    debug!("Ignoring unsolicited ok packet");
                }
                raw => {
                    let command = normalize_command(raw);
                    debug!(command = %command, "Handling bridge call");
                    let reply = match handler.handle(&command, packet.args).await {
                        Ok(result) => Packet::ok(result),
                        Err(error) => {
                            debug!(command = %command, error = %error, "Bridge call failed");
                            Packet::fail(&error)
                        }
                    };
                    outbox.send(reply)?;
                }
            }
        }
    }
}
