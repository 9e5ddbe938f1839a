//! Socket transport: every channel shares one WebSocket.
//!
//! Each binary message is `[channel id (8)][packet]`. Text, ping and pong
//! messages are ignored; a close frame ends the connection with its reason.

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::{
    inbound, outbound, BoxFuture, CloseReason, CloseSignal, Connection, Connector, InboxWriter,
    Pipe, PipeReceiver, TransportKind, INBOX_CAPACITY,
};
use crate::error::TransportError;
use crate::util::lock_or_recover;
use meetlink_transport::wire::ChannelName;

fn frame_message(channel: ChannelName, packet: &[u8]) -> Message {
    let mut buf = BytesMut::with_capacity(1 + packet.len());
    buf.put_u8(channel.id());
    buf.put_slice(packet);
    Message::Binary(buf.freeze())
}

/// Inbound slot for a channel, created by whichever happens first: a local
/// open or the first message from the peer.
struct Slot {
    inbox: InboxWriter,
    receiver: PipeReceiver,
    pipe: Option<Pipe>,
}

impl Slot {
    fn new() -> Self {
        let (inbox, receiver) = inbound(INBOX_CAPACITY);
        Slot {
            inbox,
            receiver,
            pipe: None,
        }
    }
}

pub struct SocketConnection {
    close: CloseSignal,
    slots: Arc<Mutex<HashMap<ChannelName, Slot>>>,
    /// Frames for the single socket writer.
    out_tx: mpsc::UnboundedSender<Message>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SocketConnection {
    fn spawn<S>(ws: WebSocketStream<S>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let close = CloseSignal::new();
        let slots: Arc<Mutex<HashMap<ChannelName, Slot>>> = Arc::default();

        let writer_close = close.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let is_close = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    writer_close.fire(CloseReason::Error(e.to_string()));
                    return;
                }
                if is_close {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_close = close.clone();
        let reader_slots = slots.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        if data.is_empty() {
                            continue;
                        }
                        let Some(name) = ChannelName::from_id(data[0]) else {
                            tracing::debug!(id = data[0], "dropping message for unknown channel");
                            continue;
                        };
                        let mut slots = lock_or_recover(&reader_slots);
                        slots.entry(name).or_insert_with(Slot::new).inbox.push(data.slice(1..));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(f) if !f.reason.is_empty() => CloseReason::Error(f.reason.to_string()),
                            _ => CloseReason::Graceful,
                        };
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break CloseReason::Error(e.to_string()),
                    None => break CloseReason::Graceful,
                }
            };
            for slot in lock_or_recover(&reader_slots).values() {
                slot.inbox.close();
            }
            tracing::debug!(?reason, "websocket ended");
            reader_close.fire(reason);
        });

        Arc::new(SocketConnection {
            close,
            slots,
            out_tx,
            tasks: Mutex::new(vec![writer, reader]),
        })
    }
}

impl Connection for SocketConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn open_channel(&self, name: ChannelName) -> BoxFuture<'_, Result<Pipe, TransportError>> {
        Box::pin(async move {
            if self.close.is_closed() {
                return Err(TransportError::closed("socket closed"));
            }
            let mut slots = lock_or_recover(&self.slots);
            let slot = slots.entry(name).or_insert_with(Slot::new);
            if let Some(pipe) = &slot.pipe {
                return Ok(pipe.clone());
            }

            let (sender, mut writer) = outbound();
            let out_tx = self.out_tx.clone();
            let forward = tokio::spawn(async move {
                while let Some(packet) = writer.next().await {
                    let len = packet.len();
                    let sent = out_tx.send(frame_message(name, &packet));
                    writer.written(len);
                    if sent.is_err() {
                        writer.fail();
                        return;
                    }
                }
            });
            lock_or_recover(&self.tasks).push(forward);

            let pipe = Pipe {
                sender,
                receiver: slot.receiver.clone(),
            };
            slot.pipe = Some(pipe.clone());
            Ok(pipe)
        })
    }

    fn closed(&self) -> BoxFuture<'_, CloseReason> {
        Box::pin(self.close.wait())
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            for slot in lock_or_recover(&self.slots).values() {
                if let Some(pipe) = &slot.pipe {
                    pipe.sender.close();
                }
            }
            let _ = self.out_tx.send(Message::Close(None));
            self.close.fire(CloseReason::Graceful);
        })
    }
}

impl Drop for SocketConnection {
    fn drop(&mut self) {
        for task in lock_or_recover(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

/// Dials a WebSocket URL (`ws://host:port/path`).
pub struct SocketConnector {
    url: String,
}

impl SocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        SocketConnector { url: url.into() }
    }
}

impl Connector for SocketConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>, TransportError>> {
        Box::pin(async move {
            let (ws, response) = tokio_tungstenite::connect_async(self.url.as_str())
                .await
                .map_err(|e| TransportError::connect(e.to_string()))?;
            tracing::info!(url = %self.url, status = %response.status(), "websocket connected");
            let conn: Arc<dyn Connection> = SocketConnection::spawn(ws);
            Ok(conn)
        })
    }
}

/// Accepting side of the socket transport.
pub struct SocketListener {
    listener: TcpListener,
}

impl SocketListener {
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(SocketListener { listener })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(&self) -> Result<Arc<SocketConnection>, TransportError> {
        let (stream, peer): (TcpStream, _) = self.listener.accept().await?;
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| TransportError::connect(e.to_string()))?;
        tracing::info!(%peer, "websocket accepted");
        Ok(SocketConnection::spawn(ws))
    }
}

impl Connector for SocketListener {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>, TransportError>> {
        Box::pin(async move {
            let conn: Arc<dyn Connection> = self.accept().await?;
            Ok(conn)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_prefixed_with_channel_id() {
        let Message::Binary(data) = frame_message(ChannelName::Microphone, b"pkt") else {
            panic!("expected binary message");
        };
        assert_eq!(&data[..], &[1, b'p', b'k', b't']);
    }

    #[tokio::test]
    async fn channels_multiplex_over_one_socket() {
        let listener = SocketListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let connector = SocketConnector::new(url);
        let (client, server) = tokio::join!(connector.connect(), listener.accept());
        let (client, server) = (client.unwrap(), server.unwrap());

        let mic = client.open_channel(ChannelName::Microphone).await.unwrap();
        let ctl = client.open_channel(ChannelName::Control).await.unwrap();
        mic.sender.send(Bytes::from_static(b"audio")).unwrap();
        ctl.sender.send(Bytes::from_static(b"event")).unwrap();

        let server_ctl = server.open_channel(ChannelName::Control).await.unwrap();
        let server_mic = server.open_channel(ChannelName::Microphone).await.unwrap();
        assert_eq!(server_ctl.receiver.recv().await.unwrap(), Bytes::from_static(b"event"));
        assert_eq!(server_mic.receiver.recv().await.unwrap(), Bytes::from_static(b"audio"));
    }

    #[tokio::test]
    async fn refused_connect_is_retriable() {
        let err = match SocketConnector::new("ws://127.0.0.1:1").connect().await {
            Ok(_) => panic!("expected connect failure"),
            Err(e) => e,
        };
        assert!(err.is_retriable());
    }
}
