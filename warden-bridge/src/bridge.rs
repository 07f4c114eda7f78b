//! Call/reply correlation over a pair of byte streams
//!
//! Every call pushes a waiter onto the ledger and writes its packet while
//! holding the writer lock, so ledger order always matches wire order. The
//! reader task hands each `ok`/`fail` reply to the oldest waiter. This relies
//! on the peer answering calls in the order it received them, which holds
//! for an ordered pipe served by a single loop.

use crate::error::{BridgeError, BridgeResult, RemoteError};
use crate::packet::{Packet, PacketReader, PacketWriter, STOP};
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Waiter = oneshot::Sender<Result<JsonValue, RemoteError>>;

/// Called with every packet that is neither a reply nor `stop`
pub type EventCallback = Arc<dyn Fn(Packet) + Send + Sync>;

#[derive(Default)]
struct Ledger {
    waiting: VecDeque<Waiter>,
    closed: bool,
}

struct Shared {
    writer: tokio::sync::Mutex<PacketWriter<BoxedWriter>>,
    ledger: Mutex<Ledger>,
    closed: watch::Sender<bool>,
    stop_sent: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn lock_ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Refuse new calls and fail every waiting one
    fn mark_closed(&self) {
        let waiting = {
            let mut ledger = self.lock_ledger();
            ledger.closed = true;
            std::mem::take(&mut ledger.waiting)
        };
        if !waiting.is_empty() {
            debug!(calls = waiting.len(), "Failing calls left waiting on closed bridge");
        }
        drop(waiting);
        self.closed.send_replace(true);
    }
}

/// One end of a duplex packet pipe
#[derive(Clone)]
pub struct Bridge {
    shared: Arc<Shared>,
}

impl Bridge {
    /// Start the reader task on `reader`; packets are written to `writer`
    pub fn new<R, W, F>(reader: R, writer: W, on_event: F) -> Self
    where
        R: AsyncBufRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        F: Fn(Packet) + Send + Sync + 'static,
    {
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(PacketWriter::new(Box::new(writer) as BoxedWriter)),
            ledger: Mutex::new(Ledger::default()),
            closed,
            stop_sent: AtomicBool::new(false),
            reader: Mutex::new(None),
        });

        let task = tokio::spawn(read_loop(
            PacketReader::new(reader),
            Arc::clone(&shared),
            Arc::new(on_event),
        ));
        *shared.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        Self { shared }
    }

    /// Tell the peer this end is up and listening on `address`
    pub async fn handshake(&self, address: &str) -> BridgeResult<()> {
        self.write(&Packet::ok(JsonValue::String(address.to_string())), None)
            .await
    }

    /// Issue a call and wait for its reply
    pub async fn call(&self, command: &str, args: Vec<JsonValue>) -> BridgeResult<JsonValue> {
        self.call_with_timeout(command, args, None).await
    }

    /// Issue a call, bounding both the write and the wait for the reply.
    ///
    /// A call that times out keeps its ledger slot, so its late reply is
    /// still consumed in order and cannot reach another caller. A write
    /// that fails or times out closes the bridge.
    pub async fn call_with_timeout(
        &self,
        command: &str,
        args: Vec<JsonValue>,
        timeout: Option<Duration>,
    ) -> BridgeResult<JsonValue> {
        let packet = Packet::new(command, args);
        let reply = {
            let mut writer = self.shared.writer.lock().await;
            let (tx, rx) = oneshot::channel();
            {
                let mut ledger = self.shared.lock_ledger();
                if ledger.closed {
                    return Err(BridgeError::Closed);
                }
                ledger.waiting.push_back(tx);
            }
            if let Err(e) = writer.write_packet(&packet, timeout).await {
                drop(writer);
                warn!(command, error = %e, "Bridge write failed, closing");
                self.shared.mark_closed();
                return Err(e);
            }
            rx
        };

        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, reply)
                .await
                .map_err(|_| BridgeError::Timeout(limit))?,
            None => reply.await,
        };
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(remote)) => Err(BridgeError::Remote(remote)),
            Err(_) => Err(BridgeError::Closed),
        }
    }

    /// Send an event packet that expects no reply
    pub async fn send(&self, command: &str, args: Vec<JsonValue>) -> BridgeResult<()> {
        if self.is_closed() {
            return Err(BridgeError::Closed);
        }
        self.write(&Packet::new(command, args), None).await
    }

    /// Send `stop` to the peer once, then shut this end down
    pub async fn close(&self) {
        if !self.shared.stop_sent.swap(true, Ordering::SeqCst) {
            let shutdown = async {
                let mut writer = self.shared.writer.lock().await;
                let _ = writer.write_packet(&Packet::stop(), None).await;
                let _ = writer.close().await;
            };
            if tokio::time::timeout(CLOSE_TIMEOUT, shutdown).await.is_err() {
                warn!("Timed out sending stop to bridge peer");
            }
            info!("Bridge closed");
        }
        self.shared.mark_closed();
        let reader = self
            .shared
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = reader {
            task.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Resolves once the bridge has closed, from either end
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn write(&self, packet: &Packet, timeout: Option<Duration>) -> BridgeResult<()> {
        self.shared
            .writer
            .lock()
            .await
            .write_packet(packet, timeout)
            .await
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("waiting", &self.shared.lock_ledger().waiting.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Runs until `stop` or end of stream; unreadable lines are skipped
async fn read_loop<R>(mut reader: PacketReader<R>, shared: Arc<Shared>, on_event: EventCallback)
where
    R: AsyncBufRead + Send + Unpin,
{
    loop {
        match reader.read_packet(None).await {
            Ok(packet) if packet.is_reply() => {
                let waiter = shared.lock_ledger().waiting.pop_front();
                match waiter {
                    Some(waiter) => {
                        // The caller may have timed out and gone away.
                        let _ = waiter.send(packet.into_reply());
                    }
                    None => warn!(command = %packet.command, "Reply arrived with no call waiting"),
                }
            }
            Ok(packet) if packet.command == STOP => {
                debug!("Peer sent stop");
                break;
            }
            Ok(packet) => {
                let command = packet.command.clone();
                if catch_unwind(AssertUnwindSafe(|| on_event(packet))).is_err() {
                    warn!(command = %command, "Event callback panicked");
                }
            }
            Err(BridgeError::Closed) => {
                debug!("Bridge peer closed the pipe");
                break;
            }
            Err(BridgeError::Codec(e)) => {
                warn!(error = %e, "Skipping malformed packet");
            }
            Err(e) => {
                warn!(error = %e, "Bridge read failed");
            }
        }
    }
    shared.mark_closed();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{duplex, AsyncWriteExt, BufReader, DuplexStream};

    /// A bridge plus the raw far ends of its pipes
    fn bridge_with_peer(
        on_event: impl Fn(Packet) + Send + Sync + 'static,
    ) -> (Bridge, PacketReader<BufReader<DuplexStream>>, DuplexStream) {
        let (bridge_write, peer_read) = duplex(4096);
        let (peer_write, bridge_read) = duplex(4096);
        let bridge = Bridge::new(BufReader::new(bridge_read), bridge_write, on_event);
        (bridge, PacketReader::new(BufReader::new(peer_read)), peer_write)
    }

    async fn reply(peer: &mut DuplexStream, packet: &Packet) {
        let mut line = serde_json::to_string(packet).unwrap();
        line.push('\n');
        peer.write_all(line.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn test_replies_are_matched_in_order() {
        let (bridge, mut requests, mut peer) = bridge_with_peer(|_| {});

        let first = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.call("first", vec![]).await }
        });
        assert_eq!(requests.read_packet(None).await.unwrap().command, "first");

        let second = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.call("second", vec![]).await }
        });
        assert_eq!(requests.read_packet(None).await.unwrap().command, "second");

        reply(&mut peer, &Packet::ok(json!(1))).await;
        reply(&mut peer, &Packet::fail(&RemoteError::not_found("nope"))).await;

        assert_eq!(first.await.unwrap().unwrap(), json!(1));
        match second.await.unwrap() {
            Err(BridgeError::Remote(error)) => assert_eq!(error.kind, "not_found"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_events_reach_callback() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (_bridge, _requests, mut peer) = bridge_with_peer(move |packet| {
            let _ = tx.send(packet);
        });

        reply(&mut peer, &Packet::new("stage", vec![json!("nightly"), json!("start")])).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.command, "stage");
        assert_eq!(event.args, vec![json!("nightly"), json!("start")]);
    }

    #[tokio::test]
    async fn test_stop_closes_and_fails_waiting_calls() {
        let (bridge, mut requests, mut peer) = bridge_with_peer(|_| {});

        let waiting = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.call("slow", vec![]).await }
        });
        requests.read_packet(None).await.unwrap();

        reply(&mut peer, &Packet::stop()).await;
        tokio::time::timeout(Duration::from_secs(2), bridge.closed())
            .await
            .unwrap();

        assert!(matches!(waiting.await.unwrap(), Err(BridgeError::Closed)));
        assert!(matches!(bridge.call("late", vec![]).await, Err(BridgeError::Closed)));
    }

    #[tokio::test]
    async fn test_close_sends_stop_once() {
        let (bridge, mut requests, _peer) = bridge_with_peer(|_| {});
        bridge.close().await;
        bridge.close().await;

        assert!(bridge.is_closed());
        assert_eq!(requests.read_packet(None).await.unwrap().command, STOP);
        assert!(matches!(requests.read_packet(None).await, Err(BridgeError::Closed)));
    }

    #[tokio::test]
    async fn test_timed_out_call_keeps_its_slot() {
        let (bridge, mut requests, mut peer) = bridge_with_peer(|_| {});

        let err = bridge
            .call_with_timeout("slow", vec![], Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));
        requests.read_packet(None).await.unwrap();

        let next = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.call("next", vec![]).await }
        });
        requests.read_packet(None).await.unwrap();

        reply(&mut peer, &Packet::ok(json!("late answer to slow"))).await;
        reply(&mut peer, &Packet::ok(json!("next"))).await;
        assert_eq!(next.await.unwrap().unwrap(), json!("next"));
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_skipped() {
        let (bridge, mut requests, mut peer) = bridge_with_peer(|_| {});

        let call = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.call("echo", vec![json!("abc")]).await }
        });
        assert_eq!(requests.read_packet(None).await.unwrap().command, "echo");

        peer.write_all(b"\xff\xfe garbage\n").await.unwrap();
        reply(&mut peer, &Packet::ok(json!("abc"))).await;

        assert_eq!(call.await.unwrap().unwrap(), json!("abc"));
        assert!(!bridge.is_closed());
    }
}
