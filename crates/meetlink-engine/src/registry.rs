//! # Channel Registry
//!
//! Owns every named channel of a session: its protocol state (sequence
//! counter, config handshake, outbound queue) and its current pipe. Channels
//! outlive connections; after a reconnect [`ChannelRegistry::bind`] reopens
//! each channel's pipe on the new connection, keeps the sequence counters,
//! and re-sends decoder configs before any further media.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::transport::{Connection, Pipe, PipeSender};
use crate::util::lock_or_recover;
use meetlink_transport::channel::{Admission, BackpressureConfig, ChannelState};
use meetlink_transport::fec::{self, FecPolicy};
use meetlink_transport::stats::ChannelStats;
use meetlink_transport::wire::{self, ChannelName, FrameType, FEC_MARKER_OFFSET, FEC_MARKER_SYMBOL};

struct ChannelEntry {
    state: ChannelState,
    pipe: Option<Pipe>,
    /// Last decoder config document, re-sent after a rebind.
    config: Option<Bytes>,
    /// Identifies the pipe the drain task serves.
    epoch: u64,
    kick: Arc<Notify>,
    drain_task: Option<JoinHandle<()>>,
}

impl ChannelEntry {
    fn stop_drain(&mut self) {
        if let Some(task) = self.drain_task.take() {
            task.abort();
        }
    }
}

#[derive(Default)]
struct RegistryState {
    connection: Option<Arc<dyn Connection>>,
    channels: HashMap<ChannelName, ChannelEntry>,
    next_epoch: u64,
    closed: bool,
}

struct RegistryInner {
    backpressure: BackpressureConfig,
    fec: FecPolicy,
    state: Mutex<RegistryState>,
    /// Serializes opens per channel name.
    opening: Mutex<HashMap<ChannelName, Arc<tokio::sync::Mutex<()>>>>,
    /// Bumped on every bind, unbind and close so readers re-fetch pipes.
    generation: watch::Sender<u64>,
}

/// Named channels of one session. Cheap to clone.
#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

fn same_connection(a: &Arc<dyn Connection>, b: &Arc<dyn Connection>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn is_fec_packet(packet: &[u8]) -> bool {
    packet.get(FEC_MARKER_OFFSET) == Some(&FEC_MARKER_SYMBOL)
}

impl ChannelRegistry {
    pub fn new(backpressure: BackpressureConfig, fec: FecPolicy) -> Self {
        let (generation, _) = watch::channel(0);
        ChannelRegistry {
            inner: Arc::new(RegistryInner {
                backpressure,
                fec,
                state: Mutex::new(RegistryState::default()),
                opening: Mutex::new(HashMap::new()),
                generation,
            }),
        }
    }

    pub fn fec_policy(&self) -> &FecPolicy {
        &self.inner.fec
    }

    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        lock_or_recover(&self.inner.state).connection.clone()
    }

    /// Attach a (new) connection and reopen every known channel on it.
    pub async fn bind(&self, connection: Arc<dyn Connection>) -> Result<(), TransportError> {
        let names: Vec<ChannelName> = {
            let mut state = lock_or_recover(&self.inner.state);
            state.closed = false;
            state.connection = Some(connection.clone());
            state.channels.keys().copied().collect()
        };

        for name in names {
            let pipe = connection.open_channel(name).await?;
            let mut state = lock_or_recover(&self.inner.state);
            state.next_epoch += 1;
            let epoch = state.next_epoch;
            let Some(entry) = state.channels.get_mut(&name) else {
                continue;
            };
            entry.stop_drain();
            entry.state.outbound.flush_all();
            entry.state.reset_config();
            entry.pipe = Some(pipe.clone());
            entry.epoch = epoch;
            entry.drain_task = Some(self.spawn_drain(name, pipe.sender, entry.kick.clone(), epoch));
            if let Some(config) = entry.config.clone() {
                if let Err(e) = self.send_frame_locked(entry, FrameType::Config, &config) {
                    tracing::warn!(channel = %name, error = %e, "failed to re-send decoder config");
                } else {
                    entry.state.mark_config_sent();
                    entry.state.stats.configs_sent += 1;
                }
            }
            tracing::debug!(channel = %name, epoch, "channel rebound");
        }
        self.bump();
        Ok(())
    }

    /// Detach from a lost connection. Queued packets are discarded; channel
    /// state (sequence counters, configs) is kept for the next bind.
    pub fn unbind(&self) {
        {
            let mut state = lock_or_recover(&self.inner.state);
            state.connection = None;
            for entry in state.channels.values_mut() {
                entry.stop_drain();
                entry.state.outbound.flush_all();
                entry.pipe = None;
            }
        }
        self.bump();
    }

    /// Open a channel by name. Idempotent within a session.
    ///
    /// Concurrent opens of one name share a single `open_channel` call. A
    /// pipe opened on a connection that was replaced meanwhile is closed and
    /// the open is retried on the current connection.
    pub async fn open(&self, name: ChannelName) -> Result<ChannelHandle, TransportError> {
        let opening = lock_or_recover(&self.inner.opening).entry(name).or_default().clone();
        let _opening = opening.lock().await;

        loop {
            let connection = {
                let state = lock_or_recover(&self.inner.state);
                if state.channels.contains_key(&name) {
                    return Ok(self.handle(name));
                }
                state.connection.clone().ok_or_else(TransportError::not_connected)?
            };

            let pipe = connection.open_channel(name).await?;

            {
                let mut state = lock_or_recover(&self.inner.state);
                let current = state.connection.as_ref().is_some_and(|c| same_connection(c, &connection));
                if !current {
                    drop(state);
                    pipe.sender.close();
                    tracing::debug!(channel = %name, "connection replaced during open, retrying");
                    continue;
                }
                state.next_epoch += 1;
                let epoch = state.next_epoch;
                let kick = Arc::new(Notify::new());
                let drain_task = self.spawn_drain(name, pipe.sender.clone(), kick.clone(), epoch);
                state.channels.insert(
                    name,
                    ChannelEntry {
                        state: ChannelState::new(name, self.inner.backpressure),
                        pipe: Some(pipe),
                        config: None,
                        epoch,
                        kick,
                        drain_task: Some(drain_task),
                    },
                );
                tracing::debug!(channel = %name, "channel opened");
            }
            self.bump();
            return Ok(self.handle(name));
        }
    }

    fn handle(&self, name: ChannelName) -> ChannelHandle {
        ChannelHandle {
            name,
            registry: self.clone(),
        }
    }

    pub fn is_open(&self, name: ChannelName) -> bool {
        lock_or_recover(&self.inner.state).channels.contains_key(&name)
    }

    pub fn open_channels(&self) -> Vec<ChannelName> {
        let mut names: Vec<_> = lock_or_recover(&self.inner.state).channels.keys().copied().collect();
        names.sort_by_key(|n| n.id());
        names
    }

    /// Send an already-encoded packet, queueing under backpressure.
    pub fn send(&self, name: ChannelName, packet: Bytes) -> Result<(), TransportError> {
        let mut state = lock_or_recover(&self.inner.state);
        let entry = state
            .channels
            .get_mut(&name)
            .ok_or_else(|| TransportError::closed(format!("channel {name} not open")))?;
        let is_fec = is_fec_packet(&packet);
        Self::offer_locked(entry, packet, is_fec)
    }

    /// Frame a payload with the channel's next sequence number(s), adding
    /// FEC symbols when the policy asks for them. Returns packets sent.
    pub fn send_frame(&self, name: ChannelName, frame_type: FrameType, payload: &[u8]) -> Result<usize, TransportError> {
        let mut state = lock_or_recover(&self.inner.state);
        let entry = state
            .channels
            .get_mut(&name)
            .ok_or_else(|| TransportError::closed(format!("channel {name} not open")))?;
        self.send_frame_locked(entry, frame_type, payload)
    }

    fn send_frame_locked(
        &self,
        entry: &mut ChannelEntry,
        frame_type: FrameType,
        payload: &[u8],
    ) -> Result<usize, TransportError> {
        if entry.pipe.is_none() {
            return Err(TransportError::not_connected());
        }

        if let Some(redundancy) = self.inner.fec.redundancy_for(frame_type, payload.len()) {
            match fec::encode(payload, self.inner.fec.symbol_size, redundancy) {
                Ok(block) => {
                    let packets = fec::packetize(&block, frame_type, || entry.state.next_sequence());
                    let count = packets.len();
                    for packet in packets {
                        Self::offer_locked(entry, packet, true)?;
                    }
                    return Ok(count);
                }
                Err(e) => {
                    tracing::warn!(channel = %entry.state.name(), error = %e, "FEC encode failed, sending unprotected");
                }
            }
        }

        let sequence = entry.state.next_sequence();
        Self::offer_locked(entry, wire::encode_regular(payload, sequence, frame_type), false)?;
        Ok(1)
    }

    fn offer_locked(entry: &mut ChannelEntry, packet: Bytes, is_fec: bool) -> Result<(), TransportError> {
        let Some(pipe) = &entry.pipe else {
            return Err(TransportError::not_connected());
        };
        let len = packet.len();
        match entry.state.outbound.offer(packet, pipe.sender.buffered_amount()) {
            Ok(Admission::SendNow(packet)) => {
                pipe.sender.send(packet)?;
                entry.state.stats.record_sent(len, is_fec);
                Ok(())
            }
            Ok(Admission::Queued) => {
                entry.state.stats.packets_queued += 1;
                entry.kick.notify_one();
                Ok(())
            }
            Err(full) => {
                entry.state.stats.packets_rejected += 1;
                Err(full.into())
            }
        }
    }

    /// Send the channel's decoder config unless it already went out on the
    /// current connection. Returns whether it was sent now.
    pub fn send_config(&self, name: ChannelName, config: Bytes) -> Result<bool, TransportError> {
        let mut state = lock_or_recover(&self.inner.state);
        let entry = state
            .channels
            .get_mut(&name)
            .ok_or_else(|| TransportError::closed(format!("channel {name} not open")))?;
        entry.config = Some(config.clone());
        if entry.state.is_config_sent() {
            return Ok(false);
        }
        if entry.pipe.is_none() {
            entry.state.set_pending_config(config);
            return Ok(false);
        }
        self.send_frame_locked(entry, FrameType::Config, &config)?;
        entry.state.mark_config_sent();
        entry.state.stats.configs_sent += 1;
        Ok(true)
    }

    pub fn is_config_sent(&self, name: ChannelName) -> bool {
        lock_or_recover(&self.inner.state)
            .channels
            .get(&name)
            .is_some_and(|e| e.state.is_config_sent())
    }

    /// Force the config to be sent again with the next media (tier request).
    pub fn reset_config(&self, name: ChannelName) {
        if let Some(entry) = lock_or_recover(&self.inner.state).channels.get_mut(&name) {
            entry.state.reset_config();
        }
    }

    pub fn stats(&self, name: ChannelName) -> Option<ChannelStats> {
        lock_or_recover(&self.inner.state)
            .channels
            .get(&name)
            .map(|e| e.state.stats.clone())
    }

    /// Flush the channel's queue to its pipe and release it.
    pub fn close(&self, name: ChannelName) {
        let removed = lock_or_recover(&self.inner.state).channels.remove(&name);
        if let Some(mut entry) = removed {
            Self::flush_and_release(&mut entry);
            tracing::debug!(channel = %name, "channel closed");
        }
        self.bump();
    }

    /// Close every channel and forget the connection.
    pub fn close_all(&self) {
        let entries: Vec<ChannelEntry> = {
            let mut state = lock_or_recover(&self.inner.state);
            state.closed = true;
            state.connection = None;
            state.channels.drain().map(|(_, e)| e).collect()
        };
        for mut entry in entries {
            Self::flush_and_release(&mut entry);
        }
        self.bump();
    }

    fn flush_and_release(entry: &mut ChannelEntry) {
        entry.stop_drain();
        let queued = entry.state.outbound.flush_all();
        if let Some(pipe) = entry.pipe.take() {
            for packet in queued {
                if pipe.sender.send(packet).is_err() {
                    break;
                }
            }
            pipe.sender.close();
        }
    }

    fn bump(&self) {
        self.inner.generation.send_modify(|g| *g += 1);
    }

    fn spawn_drain(&self, name: ChannelName, sender: PipeSender, kick: Arc<Notify>, epoch: u64) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(drain_loop(inner, name, sender, kick, epoch))
    }
}

/// Moves queued packets to the pipe whenever it drains below low water.
async fn drain_loop(inner: Weak<RegistryInner>, name: ChannelName, sender: PipeSender, kick: Arc<Notify>, epoch: u64) {
    loop {
        kick.notified().await;
        loop {
            let low_water = match inner.upgrade() {
                Some(inner) => inner.backpressure.low_water,
                None => return,
            };
            sender.wait_below(low_water).await;
            if sender.is_closed() {
                return;
            }
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let remaining = {
                let mut state = lock_or_recover(&inner.state);
                let Some(entry) = state.channels.get_mut(&name) else {
                    return;
                };
                if entry.epoch != epoch {
                    return;
                }
                let batch = entry.state.outbound.drain(sender.buffered_amount());
                for packet in batch {
                    let len = packet.len();
                    let is_fec = is_fec_packet(&packet);
                    if let Err(e) = sender.send(packet) {
                        tracing::debug!(channel = %name, error = %e, "drain stopped");
                        return;
                    }
                    entry.state.stats.record_sent(len, is_fec);
                }
                entry.state.outbound.len()
            };
            if remaining == 0 {
                break;
            }
        }
    }
}

/// A named channel as seen by publishers and subscribers.
#[derive(Clone)]
pub struct ChannelHandle {
    name: ChannelName,
    registry: ChannelRegistry,
}

impl ChannelHandle {
    pub fn name(&self) -> ChannelName {
        self.name
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn send_frame(&self, frame_type: FrameType, payload: &[u8]) -> Result<usize, TransportError> {
        self.registry.send_frame(self.name, frame_type, payload)
    }

    /// Next inbound packet. Survives reconnects: while the channel has no
    /// pipe it waits for the next bind. `None` once the channel is closed.
    pub async fn recv(&self) -> Option<Bytes> {
        let inner = &self.registry.inner;
        loop {
            let mut generation = inner.generation.subscribe();
            let receiver = {
                let state = lock_or_recover(&inner.state);
                if state.closed {
                    return None;
                }
                let entry = state.channels.get(&self.name)?;
                entry.pipe.as_ref().map(|p| p.receiver.clone())
            };

            match receiver {
                Some(rx) => {
                    tokio::select! {
                        packet = rx.recv() => match packet {
                            Some(packet) => return Some(packet),
                            None => {
                                if generation.changed().await.is_err() {
                                    return None;
                                }
                            }
                        },
                        changed = generation.changed() => {
                            if changed.is_err() {
                                return None;
                            }
                        }
                    }
                }
                None => {
                    if generation.changed().await.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::datachannel::{fixed_signaling, loopback_pair, DataChannelConnector};
    use crate::transport::{BoxFuture, CloseReason, Connector, TransportKind};
    use meetlink_transport::wire::{decode, VideoTier};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Counts `open_channel` calls and can hold each one until released.
    struct CountingConnection {
        inner: Arc<dyn Connection>,
        opens: AtomicU32,
        hold: Option<Arc<Notify>>,
    }

    impl CountingConnection {
        fn new(inner: Arc<dyn Connection>, hold: Option<Arc<Notify>>) -> Arc<Self> {
            Arc::new(CountingConnection {
                inner,
                opens: AtomicU32::new(0),
                hold,
            })
        }
    }

    impl Connection for CountingConnection {
        fn kind(&self) -> TransportKind {
            self.inner.kind()
        }

        fn open_channel(&self, name: ChannelName) -> BoxFuture<'_, Result<Pipe, TransportError>> {
            Box::pin(async move {
                self.opens.fetch_add(1, Ordering::AcqRel);
                if let Some(hold) = &self.hold {
                    hold.notified().await;
                }
                self.inner.open_channel(name).await
            })
        }

        fn closed(&self) -> BoxFuture<'_, CloseReason> {
            self.inner.closed()
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            self.inner.close()
        }
    }

    async fn data_channel() -> (Arc<dyn Connection>, Arc<dyn Connection>) {
        let (a, b) = loopback_pair();
        let ca = DataChannelConnector::new(fixed_signaling(a)).connect().await.unwrap();
        let cb = DataChannelConnector::new(fixed_signaling(b)).connect().await.unwrap();
        (ca, cb)
    }

    async fn connected_pair() -> (ChannelRegistry, ChannelRegistry) {
        let (a, b) = loopback_pair();
        let ca = DataChannelConnector::new(fixed_signaling(a)).connect().await.unwrap();
        let cb = DataChannelConnector::new(fixed_signaling(b)).connect().await.unwrap();
        let ra = ChannelRegistry::new(BackpressureConfig::default(), FecPolicy::default());
        let rb = ChannelRegistry::new(BackpressureConfig::default(), FecPolicy::default());
        ra.bind(ca).await.unwrap();
        rb.bind(cb).await.unwrap();
        (ra, rb)
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let (ra, _rb) = connected_pair().await;
        ra.open(ChannelName::Control).await.unwrap();
        ra.open(ChannelName::Control).await.unwrap();
        assert_eq!(ra.open_channels(), vec![ChannelName::Control]);
    }

    #[tokio::test]
    async fn open_without_connection_fails() {
        let r = ChannelRegistry::new(BackpressureConfig::default(), FecPolicy::default());
        let err = r.open(ChannelName::Control).await.err().unwrap();
        assert_eq!(err.kind, crate::error::TransportErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn frames_carry_consecutive_sequences() {
        let (ra, rb) = connected_pair().await;
        let tx = ra.open(ChannelName::Microphone).await.unwrap();
        let rx = rb.open(ChannelName::Microphone).await.unwrap();
        for _ in 0..3 {
            tx.send_frame(FrameType::Audio, b"opus").unwrap();
        }
        for expected in 0..3u32 {
            let pkt = decode(rx.recv().await.unwrap()).unwrap();
            assert_eq!(pkt.sequence, expected);
            assert_eq!(pkt.frame_type, FrameType::Audio);
        }
    }

    #[tokio::test]
    async fn large_key_frames_are_fec_protected() {
        let (ra, rb) = connected_pair().await;
        let name = ChannelName::Camera(VideoTier::High);
        let tx = ra.open(name).await.unwrap();
        let rx = rb.open(name).await.unwrap();
        let sent = tx.send_frame(FrameType::VideoKey(VideoTier::High), &[7u8; 4096]).unwrap();
        // 4 source symbols + ceil(4 * 0.25) = 1 repair.
        assert_eq!(sent, 5);
        let pkt = decode(rx.recv().await.unwrap()).unwrap();
        assert!(pkt.is_fec());
        assert_eq!(ra.stats(name).unwrap().fec_symbols_sent, 5);
    }

    #[tokio::test]
    async fn config_is_sent_once_and_again_after_rebind() {
        let (ra, _rb) = connected_pair().await;
        let name = ChannelName::Microphone;
        ra.open(name).await.unwrap();
        assert!(ra.send_config(name, Bytes::from_static(b"{}")).unwrap());
        assert!(!ra.send_config(name, Bytes::from_static(b"{}")).unwrap());
        let seq_before = ra.stats(name).unwrap().packets_sent;

        ra.unbind();
        assert!(ra.send_frame(name, FrameType::Audio, b"x").is_err());

        let (a2, _b2) = loopback_pair();
        let conn = DataChannelConnector::new(fixed_signaling(a2)).connect().await.unwrap();
        ra.bind(conn).await.unwrap();
        // The stored config went out again on bind.
        assert!(ra.is_config_sent(name));
        let stats = ra.stats(name).unwrap();
        assert_eq!(stats.configs_sent, 2);
        assert_eq!(stats.packets_sent, seq_before + 1);
    }

    #[tokio::test]
    async fn close_releases_channel() {
        let (ra, _rb) = connected_pair().await;
        let handle = ra.open(ChannelName::Control).await.unwrap();
        ra.close(ChannelName::Control);
        assert!(!ra.is_open(ChannelName::Control));
        assert!(handle.recv().await.is_none());
        assert!(handle.send_frame(FrameType::Event, b"{}").is_err());
    }

    #[tokio::test]
    async fn concurrent_opens_share_one_pipe() {
        let (ca, _cb) = data_channel().await;
        let hold = Arc::new(Notify::new());
        let counting = CountingConnection::new(ca, Some(hold.clone()));
        let registry = ChannelRegistry::new(BackpressureConfig::default(), FecPolicy::default());
        registry.bind(counting.clone()).await.unwrap();

        let name = ChannelName::Camera(VideoTier::Low);
        let (first, second, ()) = tokio::join!(registry.open(name), registry.open(name), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            hold.notify_one();
        });
        first.unwrap();
        second.unwrap();
        assert_eq!(counting.opens.load(Ordering::Acquire), 1);
        assert_eq!(registry.open_channels(), vec![name]);
    }

    #[tokio::test]
    async fn open_racing_a_rebind_lands_on_the_new_connection() {
        let (old, _old_peer) = data_channel().await;
        let hold = Arc::new(Notify::new());
        let old = CountingConnection::new(old, Some(hold.clone()));
        let (new, new_peer) = data_channel().await;
        let new = CountingConnection::new(new, None);

        let registry = ChannelRegistry::new(BackpressureConfig::default(), FecPolicy::default());
        registry.bind(old.clone()).await.unwrap();
        let name = ChannelName::Microphone;
        let opening = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.open(name).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(old.opens.load(Ordering::Acquire), 1);

        registry.bind(new.clone()).await.unwrap();
        hold.notify_one();
        let handle = opening.await.unwrap().unwrap();
        assert_eq!(new.opens.load(Ordering::Acquire), 1);

        let peer = ChannelRegistry::new(BackpressureConfig::default(), FecPolicy::default());
        peer.bind(new_peer).await.unwrap();
        let rx = peer.open(name).await.unwrap();
        handle.send_frame(FrameType::Audio, b"opus").unwrap();
        let packet = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(decode(packet).unwrap().payload.as_ref(), b"opus");
    }
}
