//! Stream transport: a session connection plus one connection per channel.
//!
//! Every TCP connection starts with a preamble:
//!
//! ```text
//! | "MLNK" | version (8) | kind (8) | session id (64) | [channel id (8)] |
//! ```
//!
//! `kind` 0 opens a session (the listener echoes the preamble back as the
//! accept); `kind` 1 attaches a channel to an existing session. After the
//! preamble, channel connections carry `[u32 len][packet]` frames in both
//! directions. EOF or an error on the session connection closes the session
//! and all of its channels.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{
    inbound, new_session_id, outbound, BoxFuture, CloseReason, CloseSignal, Connection, Connector,
    Pipe, TransportKind, INBOX_CAPACITY,
};
use crate::error::TransportError;
use crate::util::lock_or_recover;
use meetlink_transport::wire::{encode_frame, ChannelName, FrameReassembler};

const MAGIC: &[u8; 4] = b"MLNK";
const VERSION: u8 = 1;
const KIND_SESSION: u8 = 0;
const KIND_CHANNEL: u8 = 1;
const SESSION_PREAMBLE_LEN: usize = 14;
const READ_CHUNK: usize = 16 * 1024;

fn session_preamble(session_id: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(SESSION_PREAMBLE_LEN);
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(KIND_SESSION);
    buf.put_u64(session_id);
    buf.freeze()
}

fn channel_preamble(session_id: u64, name: ChannelName) -> Bytes {
    let mut buf = BytesMut::with_capacity(SESSION_PREAMBLE_LEN + 1);
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(KIND_CHANNEL);
    buf.put_u64(session_id);
    buf.put_u8(name.id());
    buf.freeze()
}

/// Parsed preamble: `(kind, session id)`.
fn parse_preamble(raw: &[u8; SESSION_PREAMBLE_LEN]) -> Result<(u8, u64), TransportError> {
    if &raw[..4] != MAGIC {
        return Err(TransportError::protocol("bad preamble magic"));
    }
    if raw[4] != VERSION {
        return Err(TransportError::protocol(format!("unsupported version {}", raw[4])));
    }
    let mut rest = &raw[6..];
    Ok((raw[5], rest.get_u64()))
}

// ─── Connection ─────────────────────────────────────────────────────────────

enum Side {
    /// Dials channel connections to this address.
    Client { addr: String },
    /// Waits for the peer to dial channel connections.
    Server,
}

/// One stream-transport session, either end.
pub struct StreamConnection {
    side: Side,
    session_id: u64,
    close: CloseSignal,
    channels: Mutex<HashMap<ChannelName, Pipe>>,
    /// Bumped whenever a peer-dialled channel attaches.
    arrivals: watch::Sender<u64>,
    session_writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamConnection {
    fn new(side: Side, session_id: u64, stream: TcpStream) -> Arc<Self> {
        let (mut reader, writer) = stream.into_split();
        let (arrivals, _) = watch::channel(0);
        let conn = Arc::new(StreamConnection {
            side,
            session_id,
            close: CloseSignal::new(),
            channels: Mutex::new(HashMap::new()),
            arrivals,
            session_writer: tokio::sync::Mutex::new(Some(writer)),
            tasks: Mutex::new(Vec::new()),
        });

        // The session connection carries nothing after the preamble; its
        // end is the session's end.
        let close = conn.close.clone();
        let watcher = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let reason = loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break CloseReason::Graceful,
                    Ok(_) => continue,
                    Err(e) => break CloseReason::Error(e.to_string()),
                }
            };
            tracing::debug!(?reason, "stream session connection ended");
            close.fire(reason);
        });
        lock_or_recover(&conn.tasks).push(watcher);
        conn
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Wire up reader and writer tasks for a channel connection.
    fn attach(&self, name: ChannelName, stream: TcpStream) -> Pipe {
        let (mut rd, mut wr) = stream.into_split();
        let (inbox, receiver) = inbound(INBOX_CAPACITY);
        let (sender, mut writer) = outbound();

        let reader = tokio::spawn(async move {
            let mut reassembler = FrameReassembler::new();
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let n = match rd.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!(channel = %name, error = %e, "channel read failed");
                        break;
                    }
                };
                reassembler.push(&buf[..n]);
                loop {
                    match reassembler.next_frame() {
                        Ok(Some(frame)) => inbox.push(frame),
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(channel = %name, error = %e, "channel framing broken");
                            inbox.close();
                            return;
                        }
                    }
                }
            }
            inbox.close();
        });

        let write_task = tokio::spawn(async move {
            while let Some(packet) = writer.next().await {
                let len = packet.len();
                if let Err(e) = wr.write_all(&encode_frame(&packet)).await {
                    tracing::debug!(channel = %name, error = %e, "channel write failed");
                    writer.written(len);
                    writer.fail();
                    return;
                }
                writer.written(len);
            }
            let _ = wr.shutdown().await;
        });

        let mut tasks = lock_or_recover(&self.tasks);
        tasks.push(reader);
        tasks.push(write_task);

        let pipe = Pipe { sender, receiver };
        lock_or_recover(&self.channels).insert(name, pipe.clone());
        self.arrivals.send_modify(|n| *n += 1);
        pipe
    }

    async fn dial_channel(&self, addr: &str, name: ChannelName) -> Result<Pipe, TransportError> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::connect(e.to_string()))?;
        stream.set_nodelay(true)?;
        stream.write_all(&channel_preamble(self.session_id, name)).await?;
        tracing::debug!(channel = %name, session = self.session_id, "stream channel dialled");
        Ok(self.attach(name, stream))
    }

    async fn await_channel(&self, name: ChannelName) -> Result<Pipe, TransportError> {
        let mut arrivals = self.arrivals.subscribe();
        loop {
            if let Some(pipe) = lock_or_recover(&self.channels).get(&name) {
                return Ok(pipe.clone());
            }
            tokio::select! {
                changed = arrivals.changed() => {
                    if changed.is_err() {
                        return Err(TransportError::closed("session dropped"));
                    }
                }
                reason = self.close.wait() => {
                    return Err(TransportError::closed(reason.message().unwrap_or_default()));
                }
            }
        }
    }
}

impl Connection for StreamConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn open_channel(&self, name: ChannelName) -> BoxFuture<'_, Result<Pipe, TransportError>> {
        Box::pin(async move {
            if self.close.is_closed() {
                return Err(TransportError::closed("session closed"));
            }
            if let Some(pipe) = lock_or_recover(&self.channels).get(&name) {
                return Ok(pipe.clone());
            }
            match &self.side {
                Side::Client { addr } => self.dial_channel(addr, name).await,
                Side::Server => self.await_channel(name).await,
            }
        })
    }

    fn closed(&self) -> BoxFuture<'_, CloseReason> {
        Box::pin(self.close.wait())
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            for pipe in lock_or_recover(&self.channels).values() {
                pipe.sender.close();
            }
            if let Some(mut writer) = self.session_writer.lock().await.take() {
                let _ = writer.shutdown().await;
            }
            self.close.fire(CloseReason::Graceful);
        })
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        for task in lock_or_recover(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

// ─── Client ─────────────────────────────────────────────────────────────────

/// Dials a [`StreamListener`].
pub struct StreamConnector {
    addr: String,
}

impl StreamConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        StreamConnector { addr: addr.into() }
    }
}

impl Connector for StreamConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>, TransportError>> {
        Box::pin(async move {
            let mut stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|e| TransportError::connect(e.to_string()))?;
            stream.set_nodelay(true)?;
            let session_id = new_session_id();
            stream.write_all(&session_preamble(session_id)).await?;

            let mut accept = [0u8; SESSION_PREAMBLE_LEN];
            stream
                .read_exact(&mut accept)
                .await
                .map_err(|e| TransportError::connect(format!("handshake: {e}")))?;
            let (kind, echoed) = parse_preamble(&accept)?;
            if kind != KIND_SESSION || echoed != session_id {
                return Err(TransportError::protocol("handshake mismatch"));
            }

            tracing::info!(addr = %self.addr, session = session_id, "stream session established");
            let conn: Arc<dyn Connection> =
                StreamConnection::new(Side::Client { addr: self.addr.clone() }, session_id, stream);
            Ok(conn)
        })
    }
}

// ─── Server ─────────────────────────────────────────────────────────────────

/// Accepting side: sessions and their channel connections.
pub struct StreamListener {
    local_addr: std::net::SocketAddr,
    sessions: tokio::sync::Mutex<mpsc::Receiver<Arc<StreamConnection>>>,
    accept_task: JoinHandle<()>,
}

impl StreamListener {
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(16);
        let accept_task = tokio::spawn(accept_loop(listener, tx));
        tracing::info!(%local_addr, "stream listener bound");
        Ok(StreamListener {
            local_addr,
            sessions: tokio::sync::Mutex::new(rx),
            accept_task,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Next established session.
    pub async fn accept(&self) -> Result<Arc<StreamConnection>, TransportError> {
        self.sessions
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| TransportError::closed("listener stopped"))
    }
}

impl Drop for StreamListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Exposes accepted sessions as a [`Connector`] so the accepting side can
/// run the same session supervisor as the dialling side.
impl Connector for StreamListener {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>, TransportError>> {
        Box::pin(async move {
            let conn: Arc<dyn Connection> = self.accept().await?;
            Ok(conn)
        })
    }
}

async fn accept_loop(listener: TcpListener, sessions: mpsc::Sender<Arc<StreamConnection>>) {
    let live: Arc<Mutex<HashMap<u64, std::sync::Weak<StreamConnection>>>> = Arc::default();
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "stream accept failed");
                continue;
            }
        };
        let sessions = sessions.clone();
        let live = live.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_incoming(stream, &sessions, &live).await {
                tracing::warn!(%peer, error = %e, "rejected stream connection");
            }
        });
    }
}

async fn handle_incoming(
    mut stream: TcpStream,
    sessions: &mpsc::Sender<Arc<StreamConnection>>,
    live: &Mutex<HashMap<u64, std::sync::Weak<StreamConnection>>>,
) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let mut raw = [0u8; SESSION_PREAMBLE_LEN];
    stream.read_exact(&mut raw).await?;
    let (kind, session_id) = parse_preamble(&raw)?;

    match kind {
        KIND_SESSION => {
            stream.write_all(&raw).await?;
            let conn = StreamConnection::new(Side::Server, session_id, stream);
            lock_or_recover(live).insert(session_id, Arc::downgrade(&conn));
            tracing::info!(session = session_id, "stream session accepted");
            sessions
                .send(conn)
                .await
                .map_err(|_| TransportError::closed("listener dropped"))
        }
        KIND_CHANNEL => {
            let id = stream.read_u8().await?;
            let name = ChannelName::from_id(id)
                .ok_or_else(|| TransportError::protocol(format!("unknown channel id {id}")))?;
            let conn = {
                let mut map = lock_or_recover(live);
                map.retain(|_, weak| weak.strong_count() > 0);
                map.get(&session_id).and_then(|weak| weak.upgrade())
            };
            let conn = conn.ok_or_else(|| TransportError::protocol(format!("unknown session {session_id}")))?;
            conn.attach(name, stream);
            tracing::debug!(channel = %name, session = session_id, "stream channel attached");
            Ok(())
        }
        other => Err(TransportError::protocol(format!("unknown preamble kind {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preamble_layout() {
        let raw = channel_preamble(0x0102030405060708, ChannelName::Microphone);
        assert_eq!(&raw[..4], b"MLNK");
        assert_eq!(raw[4], VERSION);
        assert_eq!(raw[5], KIND_CHANNEL);
        assert_eq!(raw[14], 1);
        let mut fixed = [0u8; SESSION_PREAMBLE_LEN];
        fixed.copy_from_slice(&raw[..SESSION_PREAMBLE_LEN]);
        assert_eq!(parse_preamble(&fixed).unwrap(), (KIND_CHANNEL, 0x0102030405060708));
    }

    #[test]
    fn preamble_rejects_bad_magic() {
        let mut raw = [0u8; SESSION_PREAMBLE_LEN];
        raw[..4].copy_from_slice(b"HTTP");
        assert!(parse_preamble(&raw).is_err());
    }

    #[tokio::test]
    async fn channels_rendezvous_by_name() {
        let listener = StreamListener::bind("127.0.0.1:0").await.unwrap();
        let connector = StreamConnector::new(listener.local_addr().to_string());

        let client = connector.connect().await.unwrap();
        let server = listener.accept().await.unwrap();

        let client_pipe = client.open_channel(ChannelName::Control).await.unwrap();
        let server_pipe = server.open_channel(ChannelName::Control).await.unwrap();

        client_pipe.sender.send(Bytes::from_static(b"ping")).unwrap();
        assert_eq!(server_pipe.receiver.recv().await.unwrap(), Bytes::from_static(b"ping"));
        server_pipe.sender.send(Bytes::from_static(b"pong")).unwrap();
        assert_eq!(client_pipe.receiver.recv().await.unwrap(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn client_close_ends_server_session() {
        let listener = StreamListener::bind("127.0.0.1:0").await.unwrap();
        let client = StreamConnector::new(listener.local_addr().to_string())
            .connect()
            .await
            .unwrap();
        let server = listener.accept().await.unwrap();
        client.close().await;
        assert_eq!(server.closed().await, CloseReason::Graceful);
    }
}
