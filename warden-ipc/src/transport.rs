//! IPC transport implementations
//!
//! Every message is one JSON-encoded [`MessageEnvelope`] followed by a
//! newline. The reader half keeps a single buffered reader for its whole
//! lifetime, so bytes read ahead of a line boundary are never lost.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::trace;

use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, IPC_PROTOCOL_VERSION};

/// IPC transport trait for different communication mechanisms
#[async_trait]
pub trait IpcTransport: Send {
    /// Send a message to the other end
    async fn send<T: Serialize + Send + Sync>(
        &mut self,
        message: &MessageEnvelope<T>,
    ) -> Result<(), IpcError>;

    /// Receive a message from the other end
    async fn receive<T: DeserializeOwned + Send>(&mut self) -> Result<MessageEnvelope<T>, IpcError>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), IpcError>;
}

/// Receiving half of a line transport
pub struct LineReader<R> {
    reader: R,
    line: String,
}

/// Sending half of a line transport
pub struct LineWriter<W> {
    writer: Option<W>,
}

/// Newline-delimited JSON over any async reader/writer pair
pub struct LineTransport<R, W> {
    reader: LineReader<R>,
    writer: LineWriter<W>,
}

/// Transport over the current process's stdin/stdout, used by workers
pub type StdioTransport = LineTransport<BufReader<tokio::io::Stdin>, tokio::io::Stdout>;

/// Transport over a child process's pipes, used by the coordinator
pub type ChildProcessTransport =
    LineTransport<BufReader<tokio::process::ChildStdout>, tokio::process::ChildStdin>;

/// Type-erased transport, so real and in-memory workers share one pool
pub type BoxedTransport = LineTransport<
    Box<dyn AsyncBufRead + Send + Unpin>,
    Box<dyn AsyncWrite + Send + Unpin>,
>;

impl<R> LineReader<R>
where
    R: AsyncBufRead + Send + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
        }
    }

    /// Read the next envelope, skipping blank lines.
    ///
    /// Returns [`IpcError::ConnectionClosed`] at end of stream.
    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<MessageEnvelope<T>, IpcError> {
        loop {
            self.line.clear();
            let read = self.reader.read_line(&mut self.line).await?;
            if read == 0 {
                return Err(IpcError::ConnectionClosed);
            }
            let line = self.line.trim();
            if line.is_empty() {
                continue;
            }
            trace!(bytes = read, "Received IPC line");
            return decode_envelope(line);
        }
    }
}

impl<W> LineWriter<W>
where
    W: AsyncWrite + Send + Unpin,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    pub async fn send<T: Serialize>(
        &mut self,
        message: &MessageEnvelope<T>,
    ) -> Result<(), IpcError> {
        let writer = self.writer.as_mut().ok_or(IpcError::ConnectionClosed)?;

        let mut json = serde_json::to_string(message)
            .map_err(|e| IpcError::SerializationError(e.to_string()))?;
        json.push('\n');

        writer.write_all(json.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Shut the writer down; the peer sees end of stream
    pub async fn close(&mut self) -> Result<(), IpcError> {
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncBufRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: LineReader::new(reader),
            writer: LineWriter::new(writer),
        }
    }

    /// Split into halves that can be driven from different tasks
    pub fn into_split(self) -> (LineReader<R>, LineWriter<W>) {
        (self.reader, self.writer)
    }
}

impl StdioTransport {
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl ChildProcessTransport {
    pub fn from_child(
        stdin: tokio::process::ChildStdin,
        stdout: tokio::process::ChildStdout,
    ) -> Self {
        Self::new(BufReader::new(stdout), stdin)
    }
}

impl BoxedTransport {
    pub fn boxed<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncBufRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(Box::new(reader), Box::new(writer))
    }
}

#[async_trait]
impl<R, W> IpcTransport for LineTransport<R, W>
where
    R: AsyncBufRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    async fn send<T: Serialize + Send + Sync>(
        &mut self,
        message: &MessageEnvelope<T>,
    ) -> Result<(), IpcError> {
        self.writer.send(message).await
    }

    async fn receive<T: DeserializeOwned + Send>(
        &mut self,
    ) -> Result<MessageEnvelope<T>, IpcError> {
        self.reader.receive().await
    }

    async fn close(&mut self) -> Result<(), IpcError> {
        self.writer.close().await
    }
}

/// Check the protocol version before decoding the message body, so a peer
/// speaking another version is reported as such rather than as bad JSON.
fn decode_envelope<T: DeserializeOwned>(line: &str) -> Result<MessageEnvelope<T>, IpcError> {
    let raw: MessageEnvelope<JsonValue> = serde_json::from_str(line)
        .map_err(|e| IpcError::DeserializationError(e.to_string()))?;

    if raw.protocol_version != IPC_PROTOCOL_VERSION {
        return Err(IpcError::ProtocolVersionMismatch {
            expected: IPC_PROTOCOL_VERSION,
            actual: raw.protocol_version,
        });
    }

    let message = serde_json::from_value(raw.message)
        .map_err(|e| IpcError::DeserializationError(e.to_string()))?;

    Ok(MessageEnvelope {
        protocol_version: raw.protocol_version,
        timestamp: raw.timestamp,
        message,
    })
}
