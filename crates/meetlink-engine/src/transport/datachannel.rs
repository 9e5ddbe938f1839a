//! Data-channel transport: one labelled message channel per named channel.
//!
//! The peer connection itself (ICE, DTLS, SCTP) belongs to a WebRTC stack
//! behind [`DataChannelPeer`]; an opaque signaling function produces one
//! peer per connect attempt. Each message is exactly one packet.
//! [`loopback_pair`] provides two in-process peers wired to each other.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::{
    inbound, outbound_with_gauge, BoxFuture, CloseReason, CloseSignal, Connection, Connector, Pipe,
    TransportKind, INBOX_CAPACITY,
};
use crate::error::TransportError;
use crate::util::lock_or_recover;
use meetlink_transport::wire::ChannelName;

/// One open, ordered, reliable message channel.
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn send(&self, message: Bytes) -> Result<(), TransportError>;
    /// Bytes sent but not yet delivered to the remote application.
    fn buffered_amount(&self) -> usize;
    /// Next message, or `None` once the channel closed.
    fn recv(&self) -> BoxFuture<'_, Option<Bytes>>;
}

/// A connected peer able to open labelled channels.
///
/// Opening a label that the remote side already opened joins that channel.
pub trait DataChannelPeer: Send + Sync {
    fn create_channel(&self, label: &str) -> BoxFuture<'_, Result<Arc<dyn DataChannel>, TransportError>>;
    fn closed(&self) -> BoxFuture<'_, CloseReason>;
    fn close(&self);
}

/// Signaling: negotiate a new peer connection.
pub type Signaling =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn DataChannelPeer>, TransportError>> + Send + Sync>;

pub struct DataChannelConnector {
    signaling: Signaling,
}

impl DataChannelConnector {
    pub fn new(signaling: Signaling) -> Self {
        DataChannelConnector { signaling }
    }
}

impl Connector for DataChannelConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>, TransportError>> {
        Box::pin(async move {
            let peer = (self.signaling)().await?;
            tracing::info!("data-channel peer connected");
            let conn: Arc<dyn Connection> = Arc::new(DataChannelConnection {
                peer,
                channels: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
            });
            Ok(conn)
        })
    }
}

pub struct DataChannelConnection {
    peer: Arc<dyn DataChannelPeer>,
    channels: Mutex<HashMap<ChannelName, Pipe>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection for DataChannelConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::DataChannel
    }

    fn open_channel(&self, name: ChannelName) -> BoxFuture<'_, Result<Pipe, TransportError>> {
        Box::pin(async move {
            if let Some(pipe) = lock_or_recover(&self.channels).get(&name) {
                return Ok(pipe.clone());
            }
            let channel = self.peer.create_channel(&name.to_string()).await?;

            let gauge_channel = channel.clone();
            let (sender, mut writer) = outbound_with_gauge(move || gauge_channel.buffered_amount());
            let (inbox, receiver) = inbound(INBOX_CAPACITY);

            let tx_channel = channel.clone();
            let write_task = tokio::spawn(async move {
                while let Some(packet) = writer.next().await {
                    let len = packet.len();
                    let result = tx_channel.send(packet);
                    writer.written(len);
                    if let Err(e) = result {
                        tracing::debug!(channel = %name, error = %e, "data-channel send failed");
                        writer.fail();
                        return;
                    }
                }
            });
            let read_task = tokio::spawn(async move {
                while let Some(message) = channel.recv().await {
                    inbox.push(message);
                }
                inbox.close();
            });

            {
                let mut tasks = lock_or_recover(&self.tasks);
                tasks.push(write_task);
                tasks.push(read_task);
            }
            let pipe = Pipe { sender, receiver };
            let pipe = lock_or_recover(&self.channels).entry(name).or_insert(pipe).clone();
            Ok(pipe)
        })
    }

    fn closed(&self) -> BoxFuture<'_, CloseReason> {
        self.peer.closed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            for pipe in lock_or_recover(&self.channels).values() {
                pipe.sender.close();
            }
            self.peer.close();
        })
    }
}

impl Drop for DataChannelConnection {
    fn drop(&mut self) {
        for task in lock_or_recover(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

// ─── Loopback ───────────────────────────────────────────────────────────────

/// Messages in flight toward one end of a loopback channel.
#[derive(Default)]
struct Lane {
    queue: Mutex<VecDeque<Bytes>>,
    bytes: AtomicUsize,
    notify: Notify,
    closed: AtomicBool,
}

impl Lane {
    fn push(&self, message: Bytes) {
        self.bytes.fetch_add(message.len(), Ordering::AcqRel);
        lock_or_recover(&self.queue).push_back(message);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Option<Bytes> {
        loop {
            if let Some(message) = lock_or_recover(&self.queue).pop_front() {
                self.bytes.fetch_sub(message.len(), Ordering::AcqRel);
                return Some(message);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

struct LoopbackChannel {
    label: String,
    outgoing: Arc<Lane>,
    incoming: Arc<Lane>,
}

impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn send(&self, message: Bytes) -> Result<(), TransportError> {
        if self.outgoing.closed.load(Ordering::Acquire) {
            return Err(TransportError::closed("data channel closed"));
        }
        self.outgoing.push(message);
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.outgoing.bytes.load(Ordering::Acquire)
    }

    fn recv(&self) -> BoxFuture<'_, Option<Bytes>> {
        Box::pin(self.incoming.pop())
    }
}

/// Lanes by label: `(toward a, toward b)`.
#[derive(Default)]
struct LoopbackShared {
    lanes: Mutex<HashMap<String, (Arc<Lane>, Arc<Lane>)>>,
}

impl LoopbackShared {
    fn close_all(&self) {
        for (to_a, to_b) in lock_or_recover(&self.lanes).values() {
            to_a.close();
            to_b.close();
        }
    }
}

/// One end of an in-process peer connection.
pub struct LoopbackPeer {
    shared: Arc<LoopbackShared>,
    is_a: bool,
    close: CloseSignal,
    remote_close: CloseSignal,
}

impl LoopbackPeer {
    /// Tear the connection down with an error, as a network failure would.
    pub fn fail(&self, message: &str) {
        self.shared.close_all();
        self.close.fire(CloseReason::Error(message.to_string()));
        self.remote_close.fire(CloseReason::Error(message.to_string()));
    }
}

impl DataChannelPeer for LoopbackPeer {
    fn create_channel(&self, label: &str) -> BoxFuture<'_, Result<Arc<dyn DataChannel>, TransportError>> {
        let label = label.to_string();
        Box::pin(async move {
            if self.close.is_closed() {
                return Err(TransportError::closed("peer closed"));
            }
            let (to_a, to_b) = lock_or_recover(&self.shared.lanes)
                .entry(label.clone())
                .or_default()
                .clone();
            let (outgoing, incoming) = if self.is_a { (to_b, to_a) } else { (to_a, to_b) };
            let channel: Arc<dyn DataChannel> = Arc::new(LoopbackChannel {
                label,
                outgoing,
                incoming,
            });
            Ok(channel)
        })
    }

    fn closed(&self) -> BoxFuture<'_, CloseReason> {
        Box::pin(self.close.wait())
    }

    fn close(&self) {
        self.shared.close_all();
        self.close.fire(CloseReason::Graceful);
        self.remote_close.fire(CloseReason::Graceful);
    }
}

/// Two peers connected to each other in memory.
pub fn loopback_pair() -> (Arc<LoopbackPeer>, Arc<LoopbackPeer>) {
    let shared = Arc::new(LoopbackShared::default());
    let close_a = CloseSignal::new();
    let close_b = CloseSignal::new();
    let a = Arc::new(LoopbackPeer {
        shared: shared.clone(),
        is_a: true,
        close: close_a.clone(),
        remote_close: close_b.clone(),
    });
    let b = Arc::new(LoopbackPeer {
        shared,
        is_a: false,
        close: close_b,
        remote_close: close_a,
    });
    (a, b)
}

/// Signaling that hands out a fixed peer (tests, loopback binary).
pub fn fixed_signaling(peer: Arc<dyn DataChannelPeer>) -> Signaling {
    Arc::new(move || {
        let peer = peer.clone();
        Box::pin(async move { Ok(peer) })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_channels_join_by_label() {
        let (a, b) = loopback_pair();
        let ca = a.create_channel("microphone").await.unwrap();
        let cb = b.create_channel("microphone").await.unwrap();
        ca.send(Bytes::from_static(b"hello")).unwrap();
        assert_eq!(ca.buffered_amount(), 5);
        assert_eq!(cb.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(ca.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn connection_pipes_carry_packets() {
        let (a, b) = loopback_pair();
        let ca = DataChannelConnector::new(fixed_signaling(a)).connect().await.unwrap();
        let cb = DataChannelConnector::new(fixed_signaling(b)).connect().await.unwrap();
        let pa = ca.open_channel(ChannelName::Control).await.unwrap();
        let pb = cb.open_channel(ChannelName::Control).await.unwrap();
        pa.sender.send(Bytes::from_static(b"x")).unwrap();
        assert_eq!(pb.receiver.recv().await.unwrap(), Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn failure_reaches_both_ends() {
        let (a, b) = loopback_pair();
        let ch = b.create_channel("control").await.unwrap();
        a.fail("ice failed");
        assert_eq!(b.closed().await, CloseReason::Error("ice failed".into()));
        assert!(ch.recv().await.is_none());
    }
}
