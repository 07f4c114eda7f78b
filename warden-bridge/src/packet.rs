//! Bridge packets and their line codec
//!
//! A packet is a command name followed by its arguments, encoded as one
//! JSON array per line: `["audit/state", "nightly"]`.

use crate::error::{BridgeError, BridgeResult, RemoteError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Reply carrying a result
pub const OK: &str = "ok";
/// Reply carrying a [`RemoteError`]
pub const FAIL: &str = "fail";
/// Tells the peer's reader to exit
pub const STOP: &str = "stop";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "Vec<JsonValue>", try_from = "Vec<JsonValue>")]
pub struct Packet {
    pub command: String,
    pub args: Vec<JsonValue>,
}

impl Packet {
    pub fn new(command: impl Into<String>, args: Vec<JsonValue>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn ok(result: JsonValue) -> Self {
        Self::new(OK, vec![result])
    }

    pub fn fail(error: &RemoteError) -> Self {
        Self::new(FAIL, vec![error.to_payload()])
    }

    pub fn stop() -> Self {
        Self::new(STOP, Vec::new())
    }

    /// Whether this packet answers an earlier call
    pub fn is_reply(&self) -> bool {
        self.command == OK || self.command == FAIL
    }

    /// Result of an `ok` reply, or the error of a `fail` reply
    pub fn into_reply(self) -> Result<JsonValue, RemoteError> {
        if self.command == FAIL {
            return Err(RemoteError::from_payload(self.args.first()));
        }
        let mut args = self.args;
        Ok(match args.len() {
            0 => JsonValue::Null,
            1 => args.remove(0),
            _ => JsonValue::Array(args),
        })
    }
}

impl From<Packet> for Vec<JsonValue> {
    fn from(packet: Packet) -> Self {
        let mut fields = Vec::with_capacity(packet.args.len() + 1);
        fields.push(JsonValue::String(packet.command));
        fields.extend(packet.args);
        fields
    }
}

impl TryFrom<Vec<JsonValue>> for Packet {
    type Error = String;

    fn try_from(fields: Vec<JsonValue>) -> Result<Self, Self::Error> {
        let mut fields = fields.into_iter();
        match fields.next() {
            Some(JsonValue::String(command)) => Ok(Self::new(command, fields.collect())),
            Some(other) => Err(format!("command must be a string, got {}", other)),
            None => Err("empty packet".to_string()),
        }
    }
}

/// Reads packets from a byte stream
pub struct PacketReader<R> {
    reader: R,
    line: Vec<u8>,
}

impl<R> PacketReader<R>
where
    R: AsyncBufRead + Send + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::new(),
        }
    }

    /// Read the next packet, waiting at most `timeout` when one is given.
    ///
    /// Returns [`BridgeError::Closed`] at end of stream.
    pub async fn read_packet(&mut self, timeout: Option<Duration>) -> BridgeResult<Packet> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.next_packet())
                .await
                .map_err(|_| BridgeError::Timeout(limit))?,
            None => self.next_packet().await,
        }
    }

    /// Undecodable lines surface as [`BridgeError::Codec`] so callers can skip them
    async fn next_packet(&mut self) -> BridgeResult<Packet> {
        loop {
            self.line.clear();
            if self.reader.read_until(b'\n', &mut self.line).await? == 0 {
                return Err(BridgeError::Closed);
            }
            let line = std::str::from_utf8(&self.line)
                .map_err(|e| BridgeError::Codec(e.to_string()))?
                .trim();
            if line.is_empty() {
                continue;
            }
            trace!(line, "Received packet");
            return serde_json::from_str(line).map_err(|e| BridgeError::Codec(e.to_string()));
        }
    }
}

/// Writes packets to a byte stream
pub struct PacketWriter<W> {
    writer: Option<W>,
}

impl<W> PacketWriter<W>
where
    W: AsyncWrite + Send + Unpin,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    /// Write one packet, waiting at most `timeout` when one is given
    pub async fn write_packet(
        &mut self,
        packet: &Packet,
        timeout: Option<Duration>,
    ) -> BridgeResult<()> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.write_line(packet))
                .await
                .map_err(|_| BridgeError::Timeout(limit))?,
            None => self.write_line(packet).await,
        }
    }

    async fn write_line(&mut self, packet: &Packet) -> BridgeResult<()> {
        let writer = self.writer.as_mut().ok_or(BridgeError::Closed)?;
        let mut line =
            serde_json::to_string(packet).map_err(|e| BridgeError::Codec(e.to_string()))?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Shut the stream down; the peer sees end of stream
    pub async fn close(&mut self) -> BridgeResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{duplex, AsyncWriteExt, BufReader};

    #[test]
    fn test_wire_shape() {
        let packet = Packet::new("audit/details", vec![json!("nightly"), json!(["a"])]);
        assert_eq!(
            serde_json::to_string(&packet).unwrap(),
            r#"["audit/details","nightly",["a"]]"#
        );
        assert!(serde_json::from_str::<Packet>("[]").is_err());
        assert!(serde_json::from_str::<Packet>("[1, 2]").is_err());
    }

    #[test]
    fn test_reply_values() {
        assert_eq!(Packet::new(OK, vec![]).into_reply().unwrap(), JsonValue::Null);
        assert_eq!(Packet::ok(json!(3)).into_reply().unwrap(), json!(3));
        assert_eq!(
            Packet::new(OK, vec![json!(1), json!(2)]).into_reply().unwrap(),
            json!([1, 2])
        );

        let error = Packet::fail(&RemoteError::not_found("gone")).into_reply().unwrap_err();
        assert_eq!(error.kind, "not_found");
    }

    #[tokio::test]
    async fn test_reader_skips_blank_lines_and_reports_eof() {
        let (mut raw, read_side) = duplex(1024);
        let mut reader = PacketReader::new(BufReader::new(read_side));

        raw.write_all(b"\n[\"echo\",\"abc\"]\nnot json\n").await.unwrap();
        drop(raw);

        let packet = reader.read_packet(None).await.unwrap();
        assert_eq!(packet, Packet::new("echo", vec![json!("abc")]));
        assert!(matches!(reader.read_packet(None).await, Err(BridgeError::Codec(_))));
        assert!(matches!(reader.read_packet(None).await, Err(BridgeError::Closed)));
    }

    #[tokio::test]
    async fn test_reader_reports_invalid_utf8_as_codec_error() {
        let (mut raw, read_side) = duplex(1024);
        let mut reader = PacketReader::new(BufReader::new(read_side));

        raw.write_all(b"\xff\xfe garbage\n[\"ok\",1]\n").await.unwrap();
        drop(raw);

        assert!(matches!(reader.read_packet(None).await, Err(BridgeError::Codec(_))));
        assert_eq!(reader.read_packet(None).await.unwrap(), Packet::ok(json!(1)));
        assert!(matches!(reader.read_packet(None).await, Err(BridgeError::Closed)));
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (_raw, read_side) = duplex(64);
        let mut reader = PacketReader::new(BufReader::new(read_side));
        let err = reader
            .read_packet(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_writer_closes_once() {
        let (write_side, read_side) = duplex(1024);
        let mut writer = PacketWriter::new(write_side);
        let mut reader = PacketReader::new(BufReader::new(read_side));

        writer.write_packet(&Packet::stop(), None).await.unwrap();
        writer.close().await.unwrap();
        writer.close().await.unwrap();
        assert!(writer.is_closed());
        assert!(matches!(
            writer.write_packet(&Packet::stop(), None).await,
            Err(BridgeError::Closed)
        ));

        assert_eq!(reader.read_packet(None).await.unwrap().command, STOP);
        assert!(matches!(reader.read_packet(None).await, Err(BridgeError::Closed)));
    }
}
