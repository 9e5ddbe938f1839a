//! # Transport Variants
//!
//! Every variant turns one physical connection into named channels, each
//! exposed as a [`Pipe`]: a [`PipeSender`] that reports how many bytes are
//! still waiting to reach the medium, and a [`PipeReceiver`] yielding whole
//! packets. Opening a channel is a rendezvous by name: whichever side opens
//! `camera-high` talks to whichever side opens `camera-high` on the far end.
//!
//! - [`stream`]: one TCP session connection plus one TCP connection per channel
//! - [`datachannel`]: labelled message channels of a peer connection
//! - [`socket`]: one WebSocket; channels multiplexed by a 1-byte id

pub mod datachannel;
pub mod socket;
pub mod stream;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};

pub use futures::future::BoxFuture;

use crate::error::TransportError;
use crate::util::lock_or_recover;
use meetlink_transport::wire::ChannelName;

/// Packets held per inbound channel before the oldest are dropped.
pub const INBOX_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Stream,
    DataChannel,
    Socket,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransportKind::Stream => "stream",
            TransportKind::DataChannel => "data-channel",
            TransportKind::Socket => "socket",
        })
    }
}

// ─── Connection Traits ──────────────────────────────────────────────────────

/// One established physical connection.
pub trait Connection: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Bind the named channel, opening it on the medium if needed.
    /// Idempotent: a second call returns the same pipe.
    fn open_channel(&self, name: ChannelName) -> BoxFuture<'_, Result<Pipe, TransportError>>;

    /// Resolves once, when the connection ends for any reason.
    fn closed(&self) -> BoxFuture<'_, CloseReason>;

    /// Close gracefully. Idempotent.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Produces connections; called again for every reconnect attempt.
pub trait Connector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>, TransportError>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed without an error message.
    Graceful,
    Error(String),
}

impl CloseReason {
    pub fn message(&self) -> Option<&str> {
        match self {
            CloseReason::Graceful => None,
            CloseReason::Error(msg) => Some(msg),
        }
    }
}

/// Fires once with the first close reason; later fires are ignored.
#[derive(Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<Option<CloseReason>>>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        CloseSignal { tx: Arc::new(tx) }
    }

    pub fn fire(&self, reason: CloseReason) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub async fn wait(&self) -> CloseReason {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return CloseReason::Graceful;
            }
        }
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Pipes ──────────────────────────────────────────────────────────────────

/// Both directions of one channel.
#[derive(Clone)]
pub struct Pipe {
    pub sender: PipeSender,
    pub receiver: PipeReceiver,
}

type Gauge = Box<dyn Fn() -> usize + Send + Sync>;

struct OutboundShared {
    /// Bytes accepted by `send` but not yet written to the medium.
    pending: AtomicUsize,
    /// Extra buffering reported by the medium itself (data channels).
    gauge: Option<Gauge>,
    drained: Notify,
    /// Wakes the writer when a sender closes the pipe.
    close_wake: Notify,
    closed: AtomicBool,
}

/// Sending half of a channel. Cheap to clone; never blocks.
#[derive(Clone)]
pub struct PipeSender {
    tx: mpsc::UnboundedSender<Bytes>,
    shared: Arc<OutboundShared>,
}

impl PipeSender {
    pub fn send(&self, packet: Bytes) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::closed("channel closed"));
        }
        let len = packet.len();
        self.shared.pending.fetch_add(len, Ordering::AcqRel);
        self.tx.send(packet).map_err(|_| {
            self.shared.pending.fetch_sub(len, Ordering::AcqRel);
            TransportError::closed("channel writer stopped")
        })
    }

    /// Bytes queued on the way to the peer.
    pub fn buffered_amount(&self) -> usize {
        let local = self.shared.pending.load(Ordering::Acquire);
        local + self.shared.gauge.as_ref().map_or(0, |g| g())
    }

    /// Wait until the buffered amount is at or below `level`, or the pipe closes.
    pub async fn wait_below(&self, level: usize) {
        while self.buffered_amount() > level && !self.is_closed() {
            // The gauge has no notification, so poll alongside the wakeup.
            tokio::select! {
                _ = self.shared.drained.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.close_wake.notify_one();
        self.shared.drained.notify_waiters();
    }
}

/// The medium side of a [`PipeSender`]: consumed by a writer task.
pub struct PipeWriter {
    rx: mpsc::UnboundedReceiver<Bytes>,
    shared: Arc<OutboundShared>,
}

impl PipeWriter {
    /// Next packet to write, or `None` once every sender is gone or closed.
    pub async fn next(&mut self) -> Option<Bytes> {
        loop {
            if let Ok(packet) = self.rx.try_recv() {
                return Some(packet);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            tokio::select! {
                packet = self.rx.recv() => return packet,
                _ = self.shared.close_wake.notified() => {}
            }
        }
    }

    /// Report `len` bytes handed to the medium.
    pub fn written(&self, len: usize) {
        self.shared.pending.fetch_sub(len, Ordering::AcqRel);
        self.shared.drained.notify_waiters();
    }

    /// The medium failed; further sends error.
    pub fn fail(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.rx.close();
        self.shared.drained.notify_waiters();
    }
}

pub fn outbound() -> (PipeSender, PipeWriter) {
    outbound_inner(None)
}

/// Outbound pipe whose buffered amount also includes `gauge()`.
pub fn outbound_with_gauge(gauge: impl Fn() -> usize + Send + Sync + 'static) -> (PipeSender, PipeWriter) {
    outbound_inner(Some(Box::new(gauge)))
}

fn outbound_inner(gauge: Option<Gauge>) -> (PipeSender, PipeWriter) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(OutboundShared {
        pending: AtomicUsize::new(0),
        gauge,
        drained: Notify::new(),
        close_wake: Notify::new(),
        closed: AtomicBool::new(false),
    });
    (
        PipeSender {
            tx,
            shared: shared.clone(),
        },
        PipeWriter { rx, shared },
    )
}

struct Inbox {
    queue: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// Receiving half of a channel: whole packets in arrival order.
#[derive(Clone)]
pub struct PipeReceiver {
    inbox: Arc<Inbox>,
}

impl PipeReceiver {
    /// Next packet, or `None` once the channel closed and is drained.
    pub async fn recv(&self) -> Option<Bytes> {
        loop {
            {
                let mut queue = lock_or_recover(&self.inbox.queue);
                if let Some(packet) = queue.pop_front() {
                    return Some(packet);
                }
                if self.inbox.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.inbox.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<Bytes> {
        lock_or_recover(&self.inbox.queue).pop_front()
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.closed.load(Ordering::Acquire)
    }

    /// Packets discarded because nobody was reading fast enough.
    pub fn dropped(&self) -> u64 {
        self.inbox.dropped.load(Ordering::Relaxed)
    }
}

/// The medium side of a [`PipeReceiver`]: fed by a reader task.
#[derive(Clone)]
pub struct InboxWriter {
    inbox: Arc<Inbox>,
}

impl InboxWriter {
    /// Deliver a packet, evicting the oldest when full.
    pub fn push(&self, packet: Bytes) {
        {
            let mut queue = lock_or_recover(&self.inbox.queue);
            if queue.len() >= self.inbox.capacity {
                queue.pop_front();
                self.inbox.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(packet);
        }
        self.inbox.notify.notify_one();
    }

    pub fn close(&self) {
        self.inbox.closed.store(true, Ordering::Release);
        self.inbox.notify.notify_one();
        self.inbox.notify.notify_waiters();
    }
}

pub fn inbound(capacity: usize) -> (InboxWriter, PipeReceiver) {
    let inbox = Arc::new(Inbox {
        queue: Mutex::new(VecDeque::new()),
        notify: Notify::new(),
        capacity: capacity.max(1),
        closed: AtomicBool::new(false),
        dropped: AtomicU64::new(0),
    });
    (
        InboxWriter {
            inbox: inbox.clone(),
        },
        PipeReceiver { inbox },
    )
}

/// Process-unique session id for handshakes.
pub(crate) fn new_session_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    nanos ^ (COUNTER.fetch_add(1, Ordering::Relaxed) << 48)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outbound_tracks_pending_bytes() {
        let (tx, mut writer) = outbound();
        tx.send(Bytes::from_static(&[0; 100])).unwrap();
        tx.send(Bytes::from_static(&[0; 50])).unwrap();
        assert_eq!(tx.buffered_amount(), 150);

        let pkt = writer.next().await.unwrap();
        writer.written(pkt.len());
        assert_eq!(tx.buffered_amount(), 50);

        let waiter = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.wait_below(0).await })
        };
        let pkt = writer.next().await.unwrap();
        writer.written(pkt.len());
        waiter.await.unwrap();
        assert_eq!(tx.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn failed_writer_rejects_sends() {
        let (tx, mut writer) = outbound();
        writer.fail();
        assert!(tx.send(Bytes::from_static(b"x")).is_err());
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn gauge_adds_to_buffered_amount() {
        let (tx, _writer) = outbound_with_gauge(|| 7);
        assert_eq!(tx.buffered_amount(), 7);
    }

    #[tokio::test]
    async fn inbox_drops_oldest_when_full() {
        let (writer, rx) = inbound(2);
        writer.push(Bytes::from_static(b"a"));
        writer.push(Bytes::from_static(b"b"));
        writer.push(Bytes::from_static(b"c"));
        writer.close();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"b"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"c"));
        assert_eq!(rx.recv().await, None);
        assert_eq!(rx.dropped(), 1);
    }

    #[tokio::test]
    async fn close_signal_keeps_first_reason() {
        let signal = CloseSignal::new();
        let waiter = {
            let s = signal.clone();
            tokio::spawn(async move { s.wait().await })
        };
        signal.fire(CloseReason::Error("reset".into()));
        signal.fire(CloseReason::Graceful);
        assert_eq!(waiter.await.unwrap(), CloseReason::Error("reset".into()));
        assert_eq!(signal.wait().await.message(), Some("reset"));
    }
}
