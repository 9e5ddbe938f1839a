//! # Subscriber
//!
//! Receive side of one remote stream:
//!
//! ```text
//! pipe ─► decode packet ─► gap tracking ─► FEC assembly ─► config gate
//!                                                              │
//!          playout buffer ◄── tokio mpsc ◄── decode thread ◄───┘ crossbeam
//!                │
//!                └─► video output / audio mixer source
//! ```
//!
//! Each subscribed channel has its own receive task. Decoding happens on a
//! dedicated OS thread so a slow decoder never stalls control traffic.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{FecSettings, SubscriberConfig};
use crate::error::{EngineError, MediaError};
use crate::media::{AudioDecoder, DecodedAudio, DecodedVideo, DecoderFactory, VideoDecoder};
use crate::mixer::{AudioMixer, AudioSourceHandle};
use crate::registry::{ChannelHandle, ChannelRegistry};
use crate::session::TransportSession;
use crate::util::lock_or_recover;
use meetlink_common::protocol::{ControlMessage, DecoderConfig, StreamConfig};
use meetlink_transport::channel::{SequenceCheck, SequenceTracker};
use meetlink_transport::fec::{AssemblyEvent, FecAssembler};
use meetlink_transport::jitter::{ConfigGate, GateOutcome, PlayoutBuffer};
use meetlink_transport::reconnect::SessionEvent;
use meetlink_transport::stats::ReceiverStats;
use meetlink_transport::wire::{self, ChannelName, FrameType, MediaFrame, VideoTier};

const STATUS_CAPACITY: usize = 64;
const DECODE_QUEUE: usize = 256;
const DECODED_QUEUE: usize = 64;
const VIDEO_OUTPUT_QUEUE: usize = 32;
const PLAYOUT_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubscriberState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl SubscriberState {
    fn from_event(event: &SessionEvent) -> Self {
        match event {
            SessionEvent::Connecting | SessionEvent::Reconnecting { .. } => SubscriberState::Connecting,
            SessionEvent::Connected | SessionEvent::Reconnected => SubscriberState::Connected,
            SessionEvent::ReconnectionFailed { .. } => SubscriberState::Failed,
            SessionEvent::Disconnected { .. } => SubscriberState::Disconnected,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberStatus {
    State(SubscriberState),
    Session(SessionEvent),
    ConfigApplied(ChannelName),
    /// Sequence numbers were skipped; lost packets are not retransmitted.
    Gap { channel: ChannelName, missing: u32 },
    DecodeError { channel: ChannelName, error: String },
    TierSwitched { from: VideoTier, to: VideoTier },
    /// Control-channel event from the publisher (hand raised, pin, ...).
    Remote(ControlMessage),
    Stopped,
}

/// A video frame released by the playout buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoOutput {
    pub channel: ChannelName,
    pub frame: DecodedVideo,
}

// ─── Decode thread ──────────────────────────────────────────────────────────

type GatedMedia = (FrameType, MediaFrame);

enum DecodeJob {
    Configure { channel: ChannelName, config: DecoderConfig },
    Media { channel: ChannelName, frame_type: FrameType, frame: MediaFrame },
    Release(ChannelName),
}

enum Decoded {
    Video(ChannelName, DecodedVideo),
    Audio(DecodedAudio),
}

enum DecoderSlot {
    Video {
        decoder: Box<dyn VideoDecoder>,
        /// Deltas before the first key frame are undecodable.
        awaiting_key: bool,
    },
    Audio(Box<dyn AudioDecoder>),
}

struct DecodeWorker {
    factory: Arc<dyn DecoderFactory>,
    decoders: HashMap<ChannelName, DecoderSlot>,
    output: mpsc::Sender<Decoded>,
    status: broadcast::Sender<SubscriberStatus>,
    stats: Arc<Mutex<ReceiverStats>>,
}

impl DecodeWorker {
    fn run(mut self, jobs: Receiver<DecodeJob>) {
        for job in jobs.iter() {
            let result = match job {
                DecodeJob::Configure { channel, config } => self.configure(channel, config).map_err(|e| (channel, e)),
                DecodeJob::Media {
                    channel,
                    frame_type,
                    frame,
                } => self.decode(channel, frame_type, frame).map_err(|e| (channel, e)),
                DecodeJob::Release(channel) => {
                    self.decoders.remove(&channel);
                    tracing::debug!(%channel, "decoder released");
                    Ok(())
                }
            };
            match result {
                Ok(()) => {}
                Err((channel, DecodeFailure::OutputClosed)) => {
                    tracing::debug!(%channel, "decoded output closed, decode thread exiting");
                    return;
                }
                Err((channel, DecodeFailure::Media(e))) => {
                    lock_or_recover(&self.stats).decode_errors += 1;
                    tracing::warn!(%channel, error = %e, "decode failed");
                    let _ = self.status.send(SubscriberStatus::DecodeError {
                        channel,
                        error: e.to_string(),
                    });
                }
            }
        }
        tracing::debug!("decode thread stopped");
    }

    fn configure(&mut self, channel: ChannelName, config: DecoderConfig) -> Result<(), DecodeFailure> {
        let slot = match config {
            DecoderConfig::Video(config) => {
                let mut decoder = self.factory.video();
                decoder.configure(&config)?;
                DecoderSlot::Video {
                    decoder,
                    awaiting_key: true,
                }
            }
            DecoderConfig::Audio(config) => {
                let mut decoder = self.factory.audio();
                decoder.configure(&config)?;
                DecoderSlot::Audio(decoder)
            }
        };
        self.decoders.insert(channel, slot);
        tracing::debug!(%channel, "decoder configured");
        Ok(())
    }

    fn decode(&mut self, channel: ChannelName, frame_type: FrameType, frame: MediaFrame) -> Result<(), DecodeFailure> {
        let Some(slot) = self.decoders.get_mut(&channel) else {
            return Err(MediaError::Decode(format!("no decoder for {channel}")).into());
        };
        let decoded: Vec<Decoded> = match slot {
            DecoderSlot::Video { decoder, awaiting_key } => {
                let key_frame = frame_type.is_key();
                if *awaiting_key && !key_frame {
                    tracing::trace!(%channel, "waiting for key frame");
                    return Ok(());
                }
                *awaiting_key = false;
                decoder
                    .decode(&frame.data, frame.timestamp_us, key_frame)?
                    .into_iter()
                    .map(|v| Decoded::Video(channel, v))
                    .collect()
            }
            DecoderSlot::Audio(decoder) => decoder
                .decode(&frame.data, frame.timestamp_us)?
                .into_iter()
                .map(Decoded::Audio)
                .collect(),
        };

        lock_or_recover(&self.stats).frames_decoded += decoded.len() as u64;
        for item in decoded {
            self.output.blocking_send(item).map_err(|_| DecodeFailure::OutputClosed)?;
        }
        Ok(())
    }
}

enum DecodeFailure {
    Media(MediaError),
    OutputClosed,
}

impl From<MediaError> for DecodeFailure {
    fn from(e: MediaError) -> Self {
        DecodeFailure::Media(e)
    }
}

// ─── Shared pipeline ────────────────────────────────────────────────────────

/// Which video tier channel feeds the output. `pending` is the tier being
/// switched to; it takes over on its first decoded frame.
#[derive(Debug, Clone, Copy)]
struct VideoSelection {
    current: Option<ChannelName>,
    pending: Option<ChannelName>,
}

struct Pipeline {
    stream_id: String,
    registry: ChannelRegistry,
    gate_capacity: usize,
    gates: Mutex<HashMap<ChannelName, ConfigGate<GatedMedia>>>,
    /// Video channels that lost a frame to a full decode queue; deltas are
    /// skipped until the next key frame.
    resync: Mutex<HashSet<ChannelName>>,
    /// Taken on stop so the decode thread drains and exits.
    jobs: Mutex<Option<Sender<DecodeJob>>>,
    video: Mutex<VideoSelection>,
    stats: Arc<Mutex<ReceiverStats>>,
    status: broadcast::Sender<SubscriberStatus>,
}

impl Pipeline {
    fn new(stream_id: String, registry: ChannelRegistry, gate_capacity: usize) -> Self {
        let (status, _) = broadcast::channel(STATUS_CAPACITY);
        Pipeline {
            stream_id,
            registry,
            gate_capacity,
            gates: Mutex::new(HashMap::new()),
            resync: Mutex::new(HashSet::new()),
            jobs: Mutex::new(None),
            video: Mutex::new(VideoSelection {
                current: None,
                pending: None,
            }),
            stats: Arc::default(),
            status,
        }
    }

    fn emit(&self, status: SubscriberStatus) {
        let _ = self.status.send(status);
    }

    fn submit(&self, job: DecodeJob) {
        let rejected = {
            let guard = lock_or_recover(&self.jobs);
            let Some(jobs) = guard.as_ref() else {
                return;
            };
            match jobs.try_send(job) {
                Ok(()) => return,
                Err(TrySendError::Full(job)) => job,
                Err(TrySendError::Disconnected(_)) => {
                    tracing::debug!(stream = %self.stream_id, "decode thread gone");
                    return;
                }
            }
        };

        lock_or_recover(&self.stats).decode_queue_dropped += 1;
        match rejected {
            DecodeJob::Media {
                channel, frame_type, ..
            } if frame_type.is_video() => {
                tracing::warn!(stream = %self.stream_id, %channel, "decode queue full, video frame dropped");
                lock_or_recover(&self.resync).insert(channel);
                self.request_key_frame(channel);
            }
            _ => {
                tracing::warn!(stream = %self.stream_id, "decode queue full, dropping job");
            }
        }
    }

    /// Queue a media frame, skipping video deltas on a channel that is
    /// waiting to resynchronize on a key frame.
    fn submit_media(&self, channel: ChannelName, frame_type: FrameType, frame: MediaFrame) {
        if frame_type.is_video() {
            let mut resync = lock_or_recover(&self.resync);
            if resync.contains(&channel) {
                if !frame_type.is_key() {
                    tracing::trace!(%channel, "skipping delta until key frame");
                    return;
                }
                resync.remove(&channel);
            }
        }
        self.submit(DecodeJob::Media {
            channel,
            frame_type,
            frame,
        });
    }

    fn add_gate(&self, channel: ChannelName) {
        lock_or_recover(&self.gates)
            .entry(channel)
            .or_insert_with(|| ConfigGate::new(self.gate_capacity));
    }

    /// Apply a channel's decoder config once; media held by the gate follows
    /// it to the decoder in arrival order.
    ///
    /// The config and the held media are queued before the gates lock is
    /// released, so media passing the open gate on another task lands
    /// behind them.
    fn apply_config(&self, config: StreamConfig) {
        let channel = config.channel_name;
        let is_video = matches!(config.config, DecoderConfig::Video(_));
        {
            let mut gates = lock_or_recover(&self.gates);
            let Some(gate) = gates.get_mut(&channel) else {
                tracing::debug!(%channel, "config for unsubscribed channel");
                return;
            };
            let Some(released) = gate.apply_config() else {
                tracing::debug!(%channel, "duplicate config ignored");
                return;
            };

            tracing::info!(%channel, held = released.len(), "decoder config applied");
            self.submit(DecodeJob::Configure {
                channel,
                config: config.config,
            });
            for (frame_type, frame) in released {
                self.submit_media(channel, frame_type, frame);
            }
        }
        self.emit(SubscriberStatus::ConfigApplied(channel));

        if is_video {
            // Start decoding at the next key frame rather than the next interval.
            self.request_key_frame(channel);
        }
    }

    fn request_key_frame(&self, channel: ChannelName) {
        let message = ControlMessage::RequestKeyFrame { channel_name: channel };
        if let Err(e) = send_control(&self.registry, &message) {
            tracing::debug!(%channel, error = %e, "key frame request not sent");
        }
    }

    fn media(&self, channel: ChannelName, frame_type: FrameType, payload: bytes::Bytes) {
        let frame = match MediaFrame::decode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                lock_or_recover(&self.stats).malformed += 1;
                tracing::debug!(%channel, error = %e, "dropping malformed media frame");
                return;
            }
        };
        let outcome = {
            let mut gates = lock_or_recover(&self.gates);
            let Some(gate) = gates.get_mut(&channel) else {
                return;
            };
            let overflowed = gate.overflowed;
            let outcome = gate.offer((frame_type, frame));
            let mut stats = lock_or_recover(&self.stats);
            if matches!(outcome, GateOutcome::Held) {
                stats.gated += 1;
            }
            stats.gate_overflow += gate.overflowed - overflowed;
            outcome
        };
        if let GateOutcome::Pass((frame_type, frame)) = outcome {
            self.submit_media(channel, frame_type, frame);
        }
    }

    fn control(&self, payload: &[u8]) {
        let message = match ControlMessage::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                lock_or_recover(&self.stats).malformed += 1;
                tracing::debug!(error = %e, "dropping unreadable control message");
                return;
            }
        };
        match message {
            ControlMessage::StreamConfig(config) => self.apply_config(config),
            ControlMessage::DecoderConfigs { configs } => {
                for config in configs {
                    self.apply_config(config);
                }
            }
            other => {
                tracing::debug!(?other, "remote event");
                self.emit(SubscriberStatus::Remote(other));
            }
        }
    }

    /// Route one reconstructed payload by its frame type.
    fn deliver(&self, channel: ChannelName, frame_type: FrameType, payload: bytes::Bytes) {
        if frame_type.is_media() {
            self.media(channel, frame_type, payload);
        } else if matches!(frame_type, FrameType::Config | FrameType::Event) {
            self.control(&payload);
        } else {
            tracing::trace!(%channel, ?frame_type, "ignoring packet");
        }
    }
}

fn send_control(registry: &ChannelRegistry, message: &ControlMessage) -> Result<(), EngineError> {
    let bytes = message.to_bytes()?;
    registry.send_frame(ChannelName::Control, message.frame_type(), &bytes)?;
    Ok(())
}

// ─── Tasks ──────────────────────────────────────────────────────────────────

async fn receive_loop(handle: ChannelHandle, pipeline: Arc<Pipeline>, fec: FecSettings) {
    let channel = handle.name();
    let mut tracker = SequenceTracker::new();
    let mut assembler = FecAssembler::new(fec.window, fec.max_blocks);

    while let Some(bytes) = handle.recv().await {
        {
            let mut stats = lock_or_recover(&pipeline.stats);
            stats.packets_received += 1;
            stats.bytes_received += bytes.len() as u64;
        }
        let packet = match wire::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                lock_or_recover(&pipeline.stats).malformed += 1;
                tracing::debug!(%channel, error = %e, "dropping malformed packet");
                continue;
            }
        };

        match tracker.record(packet.sequence) {
            SequenceCheck::Gap { missing } => {
                {
                    let mut stats = lock_or_recover(&pipeline.stats);
                    stats.gaps += 1;
                    stats.packets_missing += missing as u64;
                }
                tracing::debug!(%channel, seq = packet.sequence, missing, "sequence gap");
                pipeline.emit(SubscriberStatus::Gap { channel, missing });
            }
            SequenceCheck::Late => {
                lock_or_recover(&pipeline.stats).late_packets += 1;
            }
            SequenceCheck::Reset => {
                tracing::info!(%channel, seq = packet.sequence, "sequence jump, tracking restarted");
            }
            SequenceCheck::First | SequenceCheck::InOrder => {}
        }

        if !packet.is_fec() {
            pipeline.deliver(channel, packet.frame_type, packet.payload);
            continue;
        }

        let (recovered, dropped) = (assembler.blocks_recovered, assembler.blocks_dropped);
        let event = assembler.push(&packet);
        {
            let mut stats = lock_or_recover(&pipeline.stats);
            stats.fec_recovered += assembler.blocks_recovered - recovered;
            stats.fec_dropped += assembler.blocks_dropped - dropped;
        }
        match event {
            Ok(AssemblyEvent::Recovered {
                frame_type, payload, ..
            }) => pipeline.deliver(channel, frame_type, payload),
            Ok(AssemblyEvent::Pending | AssemblyEvent::Stale) => {}
            Err(e) => {
                tracing::debug!(%channel, seq = packet.sequence, error = %e, "dropping FEC symbol");
            }
        }
    }
    tracing::debug!(%channel, "receive loop ended");
}

/// Playout: realign decoded video against the audio clock, feed the mixer.
async fn output_loop(
    pipeline: Arc<Pipeline>,
    mut decoded: mpsc::Receiver<Decoded>,
    mut playout: PlayoutBuffer<VideoOutput>,
    mut audio_source: Option<AudioSourceHandle>,
    mixer_format: Option<(u32, u16)>,
    video_out: mpsc::Sender<VideoOutput>,
) {
    let mut tick = tokio::time::interval(PLAYOUT_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut first_audio_ts: Option<u64> = None;
    let mut format_warned = false;

    loop {
        tokio::select! {
            item = decoded.recv() => {
                let Some(item) = item else {
                    break;
                };
                match item {
                    Decoded::Audio(audio) => {
                        first_audio_ts.get_or_insert(audio.timestamp_us as u64);
                        let Some(source) = audio_source.as_mut() else {
                            continue;
                        };
                        if mixer_format.is_some_and(|f| f != (audio.sample_rate, audio.channels)) {
                            if !format_warned {
                                format_warned = true;
                                tracing::warn!(
                                    sample_rate = audio.sample_rate,
                                    channels = audio.channels,
                                    "decoded audio does not match the mixer format, not mixing"
                                );
                            }
                            continue;
                        }
                        source.push(&audio.samples);
                    }
                    Decoded::Video(channel, frame) => {
                        if !select_video(&pipeline, channel, &mut playout) {
                            continue;
                        }
                        playout.push(frame.timestamp_us, VideoOutput { channel, frame }, quanta::Instant::now());
                    }
                }
            }
            _ = tick.tick() => {}
        }

        let audio_clock = match (&audio_source, first_audio_ts) {
            (Some(source), Some(first)) if source.played_us() > 0 => Some(first + source.played_us()),
            _ => None,
        };
        let late = playout.frames_late;
        for (_, output) in playout.release(quanta::Instant::now(), audio_clock) {
            if video_out.try_send(output).is_err() {
                tracing::trace!("video output full or taken, frame dropped");
            }
        }
        lock_or_recover(&pipeline.stats).frames_late += playout.frames_late - late;
    }
    tracing::debug!("output loop ended");
}

/// Whether a decoded frame from `channel` should be shown. The first frame
/// of a pending tier completes the switch and retires the old tier.
fn select_video(pipeline: &Pipeline, channel: ChannelName, playout: &mut PlayoutBuffer<VideoOutput>) -> bool {
    let retired = {
        let mut video = lock_or_recover(&pipeline.video);
        if video.current == Some(channel) {
            return true;
        }
        if video.pending != Some(channel) {
            return false;
        }
        let old = video.current.replace(channel);
        video.pending = None;
        old
    };

    playout.clear();
    if let Some(old) = retired {
        pipeline.registry.close(old);
        lock_or_recover(&pipeline.gates).remove(&old);
        pipeline.submit(DecodeJob::Release(old));
        if let (Some(from), Some(to)) = (old.tier(), channel.tier()) {
            tracing::info!(%from, %to, "tier switch complete");
            pipeline.emit(SubscriberStatus::TierSwitched { from, to });
        }
    }
    true
}

async fn forward_session_events(
    mut events: broadcast::Receiver<SessionEvent>,
    state: watch::Sender<SubscriberState>,
    pipeline: Arc<Pipeline>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let next = SubscriberState::from_event(&event);
                if state.send_replace(next) != next {
                    pipeline.emit(SubscriberStatus::State(next));
                }
                pipeline.emit(SubscriberStatus::Session(event));
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "session events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

// ─── Subscriber ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct Running {
    receivers: HashMap<ChannelName, JoinHandle<()>>,
    output_task: Option<JoinHandle<()>>,
    status_task: Option<JoinHandle<()>>,
    decode_thread: Option<thread::JoinHandle<()>>,
    tier: Option<VideoTier>,
    stopped: bool,
}

pub struct Subscriber {
    config: SubscriberConfig,
    fec: FecSettings,
    session: TransportSession,
    decoders: Arc<dyn DecoderFactory>,
    mixer: Option<AudioMixer>,
    pipeline: Arc<Pipeline>,
    state: watch::Sender<SubscriberState>,
    started: AtomicBool,
    video_out: Mutex<Option<mpsc::Receiver<VideoOutput>>>,
    running: Mutex<Running>,
}

impl Subscriber {
    pub fn new(
        stream_id: impl Into<String>,
        config: SubscriberConfig,
        session: TransportSession,
        decoders: Arc<dyn DecoderFactory>,
        mixer: Option<AudioMixer>,
    ) -> Self {
        let pipeline = Arc::new(Pipeline::new(
            stream_id.into(),
            session.registry().clone(),
            config.gate_capacity,
        ));
        let (state, _) = watch::channel(SubscriberState::Disconnected);
        Subscriber {
            config,
            fec: FecSettings::default(),
            session,
            decoders,
            mixer,
            pipeline,
            state,
            started: AtomicBool::new(false),
            video_out: Mutex::new(None),
            running: Mutex::new(Running::default()),
        }
    }

    /// FEC assembly window for received blocks. Applies to channels
    /// opened afterwards.
    pub fn with_fec(mut self, fec: FecSettings) -> Self {
        self.fec = fec;
        self
    }

    pub fn stream_id(&self) -> &str {
        &self.pipeline.stream_id
    }

    pub fn is_own_stream(&self) -> bool {
        self.config.is_own_stream
    }

    pub fn session(&self) -> &TransportSession {
        &self.session
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SubscriberState> {
        self.state.subscribe()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SubscriberStatus> {
        self.pipeline.status.subscribe()
    }

    pub fn stats(&self) -> ReceiverStats {
        lock_or_recover(&self.pipeline.stats).clone()
    }

    /// Currently displayed video tier.
    pub fn tier(&self) -> Option<VideoTier> {
        lock_or_recover(&self.pipeline.video).current.and_then(ChannelName::tier)
    }

    /// Released video frames, in presentation order. Available once, after
    /// `start`.
    pub fn take_video_output(&self) -> Option<mpsc::Receiver<VideoOutput>> {
        lock_or_recover(&self.video_out).take()
    }

    /// Connect, open channels and start the decode pipeline.
    pub async fn start(&self) -> Result<(), EngineError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(EngineError::State("subscriber already started"));
        }
        if lock_or_recover(&self.running).stopped {
            return Err(EngineError::State("subscriber stopped"));
        }

        let status_task = tokio::spawn(forward_session_events(
            self.session.subscribe(),
            self.state.clone(),
            self.pipeline.clone(),
        ));
        lock_or_recover(&self.running).status_task = Some(status_task);
        self.session.connect().await?;
        // Catch up if the forwarder subscribed after the first events.
        if self.state.send_replace(SubscriberState::Connected) != SubscriberState::Connected {
            self.pipeline.emit(SubscriberStatus::State(SubscriberState::Connected));
        }

        // Decode thread and output task.
        let (jobs, job_rx) = bounded(DECODE_QUEUE);
        let (decoded_tx, decoded_rx) = mpsc::channel(DECODED_QUEUE);
        let worker = DecodeWorker {
            factory: self.decoders.clone(),
            decoders: HashMap::new(),
            output: decoded_tx,
            status: self.pipeline.status.clone(),
            stats: self.pipeline.stats.clone(),
        };
        let decode_thread = thread::Builder::new()
            .name(format!("meetlink-dec-{}", self.pipeline.stream_id))
            .spawn(move || worker.run(job_rx))
            .map_err(|e| MediaError::Decode(format!("failed to spawn decode thread: {e}")))?;
        *lock_or_recover(&self.pipeline.jobs) = Some(jobs);

        let audio_source = match &self.mixer {
            Some(mixer) => mixer.add_source(&self.pipeline.stream_id, self.config.is_own_stream),
            None => None,
        };
        let mixer_format = self.mixer.as_ref().map(|m| (m.sample_rate(), m.channels()));
        let (video_tx, video_rx) = mpsc::channel(VIDEO_OUTPUT_QUEUE);
        *lock_or_recover(&self.video_out) = Some(video_rx);
        let output_task = tokio::spawn(output_loop(
            self.pipeline.clone(),
            decoded_rx,
            PlayoutBuffer::new(self.config.playout.clone()),
            audio_source,
            mixer_format,
            video_tx,
        ));

        {
            let mut running = lock_or_recover(&self.running);
            running.decode_thread = Some(decode_thread);
            running.output_task = Some(output_task);
        }

        self.open(ChannelName::Control).await?;
        let video = self.config.source.video_channel(self.config.tier);
        lock_or_recover(&self.pipeline.video).current = Some(video);
        lock_or_recover(&self.running).tier = Some(self.config.tier);
        self.open(video).await?;
        if !self.config.is_own_stream {
            self.open(self.config.source.audio_channel()).await?;
        }

        tracing::info!(
            stream = %self.pipeline.stream_id,
            tier = %self.config.tier,
            own = self.config.is_own_stream,
            "subscriber started"
        );
        Ok(())
    }

    async fn open(&self, channel: ChannelName) -> Result<(), EngineError> {
        if channel != ChannelName::Control {
            self.pipeline.add_gate(channel);
        }
        let handle = self.session.registry().open(channel).await?;
        let task = tokio::spawn(receive_loop(handle, self.pipeline.clone(), self.fec.clone()));
        if let Some(old) = lock_or_recover(&self.running).receivers.insert(channel, task) {
            old.abort();
        }
        Ok(())
    }

    /// Ask the publisher for another tier and move to it once its first
    /// frame decodes. The old tier keeps playing until then.
    pub async fn switch_bitrate(&self, tier: VideoTier) -> Result<(), EngineError> {
        if !self.is_started() {
            return Err(EngineError::State("subscriber not started"));
        }
        let target = self.config.source.video_channel(tier);
        {
            let mut video = lock_or_recover(&self.pipeline.video);
            if video.current == Some(target) || video.pending == Some(target) {
                return Ok(());
            }
            if let Some(abandoned) = video.pending.replace(target) {
                drop(video);
                self.session.registry().close(abandoned);
                lock_or_recover(&self.pipeline.gates).remove(&abandoned);
                self.pipeline.submit(DecodeJob::Release(abandoned));
            }
        }

        send_control(self.session.registry(), &ControlMessage::RequestTier { tier })?;
        self.open(target).await?;
        lock_or_recover(&self.running).tier = Some(tier);
        tracing::info!(%tier, "tier requested");
        Ok(())
    }

    /// Stop receiving: channel tasks, then the decode thread, then the
    /// session. Idempotent.
    pub async fn stop(&self) {
        let running = {
            let mut running = lock_or_recover(&self.running);
            if running.stopped {
                return;
            }
            let taken = std::mem::take(&mut *running);
            running.stopped = true;
            taken
        };

        for task in running.receivers.values() {
            task.abort();
        }
        for (_, task) in running.receivers {
            let _ = task.await;
        }

        // Dropping the job sender ends the decode thread after its queue.
        lock_or_recover(&self.pipeline.jobs).take();
        if let Some(thread) = running.decode_thread {
            let joined = tokio::task::spawn_blocking(move || thread.join().is_ok()).await;
            if !matches!(joined, Ok(true)) {
                tracing::warn!("decode thread did not exit cleanly");
            }
        }
        if let Some(task) = running.output_task {
            task.abort();
            let _ = task.await;
        }
        if let Some(mixer) = &self.mixer {
            mixer.remove_source(&self.pipeline.stream_id);
        }

        self.session.disconnect().await;
        if let Some(task) = running.status_task {
            task.abort();
        }
        self.state.send_replace(SubscriberState::Disconnected);
        self.started.store(false, Ordering::Release);
        self.pipeline.emit(SubscriberStatus::Stopped);
        tracing::info!(stream = %self.pipeline.stream_id, "subscriber stopped");
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let running = lock_or_recover(&self.running);
        for task in running
            .receivers
            .values()
            .chain(&running.output_task)
            .chain(&running.status_task)
        {
            task.abort();
        }
        lock_or_recover(&self.pipeline.jobs).take();
        if let Some(mixer) = &self.mixer {
            mixer.remove_source(&self.pipeline.stream_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::synthetic::SyntheticDecoderFactory;
    use crate::transport::datachannel::{fixed_signaling, loopback_pair, DataChannelConnector, LoopbackPeer};
    use meetlink_common::protocol::{AudioDecoderConfig, VideoDecoderConfig};
    use meetlink_transport::channel::BackpressureConfig;
    use meetlink_transport::fec::FecPolicy;
    use meetlink_transport::reconnect::BackoffPolicy;

    fn session(peer: Arc<LoopbackPeer>) -> TransportSession {
        TransportSession::new(
            Arc::new(DataChannelConnector::new(fixed_signaling(peer))),
            ChannelRegistry::new(BackpressureConfig::default(), FecPolicy::default()),
            BackoffPolicy::default(),
        )
    }

    fn camera_config(channel: ChannelName) -> StreamConfig {
        StreamConfig::video(
            channel,
            VideoDecoderConfig {
                codec: "vp8".into(),
                coded_width: 320,
                coded_height: 180,
                frame_rate: 30.0,
                description: None,
            },
        )
    }

    fn video_config(channel: ChannelName) -> Vec<u8> {
        ControlMessage::StreamConfig(camera_config(channel))
            .to_bytes()
            .unwrap()
            .to_vec()
    }

    fn video_frame(ts: u32, key: bool) -> Vec<u8> {
        let mut data = vec![if key { b'K' } else { b'D' }];
        data.extend_from_slice(&[0xA5; 32]);
        MediaFrame {
            timestamp_us: ts,
            data: data.into(),
        }
        .encode()
        .to_vec()
    }

    /// A subscriber and the raw registry of the publishing end.
    async fn pair(config: SubscriberConfig, mixer: Option<AudioMixer>) -> (Subscriber, TransportSession) {
        let (a, b) = loopback_pair();
        let publisher = session(a);
        publisher.connect().await.unwrap();
        let subscriber = Subscriber::new(
            "remote-1",
            config,
            session(b),
            Arc::new(SyntheticDecoderFactory),
            mixer,
        );
        (subscriber, publisher)
    }

    #[tokio::test]
    async fn media_waits_for_config_then_plays() {
        let config = SubscriberConfig {
            tier: VideoTier::Low,
            ..SubscriberConfig::default()
        };
        let (subscriber, publisher) = pair(config, None).await;
        subscriber.start().await.unwrap();
        let mut video = subscriber.take_video_output().unwrap();
        assert!(subscriber.take_video_output().is_none());

        let channel = ChannelName::Camera(VideoTier::Low);
        let registry = publisher.registry().clone();
        registry.open(channel).await.unwrap();
        registry.send_frame(channel, FrameType::VideoKey(VideoTier::Low), &video_frame(0, true)).unwrap();
        registry.send_frame(channel, FrameType::VideoDelta(VideoTier::Low), &video_frame(33_333, false)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(subscriber.stats().frames_decoded, 0);

        registry.send_config(channel, video_config(channel).into()).unwrap();
        let first = tokio::time::timeout(Duration::from_secs(2), video.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), video.recv()).await.unwrap().unwrap();
        assert_eq!(first.frame.timestamp_us, 0);
        assert_eq!(second.frame.timestamp_us, 33_333);
        assert_eq!(first.channel, channel);

        // A repeated config changes nothing.
        registry.reset_config(channel);
        registry.send_config(channel, video_config(channel).into()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(subscriber.stats().gated, 2);
        assert_eq!(subscriber.stats().frames_decoded, 2);

        subscriber.stop().await;
        assert_eq!(subscriber.state(), SubscriberState::Disconnected);
    }

    #[tokio::test]
    async fn own_stream_is_not_mixed() {
        let mixer = AudioMixer::new(48_000, 1);
        let config = SubscriberConfig {
            is_own_stream: true,
            ..SubscriberConfig::default()
        };
        let (subscriber, _publisher) = pair(config, Some(mixer.clone())).await;
        subscriber.start().await.unwrap();
        assert_eq!(mixer.source_count(), 0);
        assert!(!subscriber.session().registry().is_open(ChannelName::Microphone));
        subscriber.stop().await;
    }

    #[tokio::test]
    async fn remote_audio_reaches_mixer() {
        let mixer = AudioMixer::new(48_000, 1);
        let (subscriber, publisher) = pair(SubscriberConfig::default(), Some(mixer.clone())).await;
        subscriber.start().await.unwrap();
        assert!(mixer.has_source("remote-1"));

        let registry = publisher.registry().clone();
        registry.open(ChannelName::Microphone).await.unwrap();
        let config = ControlMessage::StreamConfig(StreamConfig::audio(
            ChannelName::Microphone,
            AudioDecoderConfig {
                codec: "opus".into(),
                sample_rate: 48_000,
                channel_count: 1,
                description: Some(b"OggSOpusHead".to_vec()),
            },
        ));
        registry
            .send_config(ChannelName::Microphone, config.to_bytes().unwrap())
            .unwrap();
        let mut chunk = b"OggS".to_vec();
        chunk.extend_from_slice(&960u32.to_be_bytes());
        let frame = MediaFrame {
            timestamp_us: 0,
            data: chunk.into(),
        };
        registry
            .send_frame(ChannelName::Microphone, FrameType::Audio, &frame.encode())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let out = mixer.output(960);
        assert!(out.samples.iter().all(|s| (*s - 0.25).abs() < 1e-6));

        subscriber.stop().await;
        assert!(!mixer.has_source("remote-1"));
    }

    #[tokio::test]
    async fn remote_events_are_forwarded() {
        let (subscriber, publisher) = pair(SubscriberConfig::default(), None).await;
        let mut status = subscriber.subscribe();
        subscriber.start().await.unwrap();

        let registry = publisher.registry().clone();
        registry.open(ChannelName::Control).await.unwrap();
        let message = ControlMessage::HandRaised;
        registry
            .send_frame(ChannelName::Control, message.frame_type(), &message.to_bytes().unwrap())
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(SubscriberStatus::Remote(m)) = status.recv().await {
                    return m;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event, ControlMessage::HandRaised);
        subscriber.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_blocks_restart() {
        let (subscriber, _publisher) = pair(SubscriberConfig::default(), None).await;
        subscriber.stop().await;
        subscriber.stop().await;
        assert!(subscriber.start().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn control_config_stays_ahead_of_streaming_media() {
        let config = SubscriberConfig {
            tier: VideoTier::Low,
            ..SubscriberConfig::default()
        };
        let (subscriber, publisher) = pair(config, None).await;
        subscriber.start().await.unwrap();
        let mut video = subscriber.take_video_output().unwrap();

        let channel = ChannelName::Camera(VideoTier::Low);
        let registry = publisher.registry().clone();
        registry.open(ChannelName::Control).await.unwrap();
        registry.open(channel).await.unwrap();

        let streamer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for i in 0u32.. {
                    let key = i % 5 == 0;
                    let frame_type = if key {
                        FrameType::VideoKey(VideoTier::Low)
                    } else {
                        FrameType::VideoDelta(VideoTier::Low)
                    };
                    let _ = registry.send_frame(channel, frame_type, &video_frame(i * 10_000, key));
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The config arrives on the control channel while the camera channel streams.
        let configs = ControlMessage::DecoderConfigs {
            configs: vec![camera_config(channel)],
        };
        registry
            .send_frame(ChannelName::Control, configs.frame_type(), &configs.to_bytes().unwrap())
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), video.recv()).await.unwrap().unwrap();
        streamer.abort();
        let stats = subscriber.stats();
        assert!(stats.frames_decoded > 0);
        assert_eq!(stats.decode_errors, 0);
        subscriber.stop().await;
    }

    #[tokio::test]
    async fn full_decode_queue_skips_to_next_key_frame() {
        let (a, b) = loopback_pair();
        let remote = session(a);
        remote.connect().await.unwrap();
        let local = session(b);
        local.connect().await.unwrap();
        let requests = remote.registry().open(ChannelName::Control).await.unwrap();
        local.registry().open(ChannelName::Control).await.unwrap();

        let pipeline = Pipeline::new("remote-1".into(), local.registry().clone(), 8);
        // A decode thread that never drains, with room for one job.
        let (jobs, queued) = bounded(1);
        *lock_or_recover(&pipeline.jobs) = Some(jobs);
        let channel = ChannelName::Camera(VideoTier::Low);
        let key = FrameType::VideoKey(VideoTier::Low);
        let delta = FrameType::VideoDelta(VideoTier::Low);
        pipeline.add_gate(channel);

        pipeline.control(&video_config(channel));
        pipeline.media(channel, key, video_frame(0, true).into());
        assert_eq!(lock_or_recover(&pipeline.stats).decode_queue_dropped, 1);
        assert!(matches!(queued.try_recv(), Ok(DecodeJob::Configure { .. })));

        // The delta after the lost frame never reaches the decoder.
        pipeline.media(channel, delta, video_frame(33_333, false).into());
        assert!(queued.try_recv().is_err());

        pipeline.media(channel, key, video_frame(66_666, true).into());
        match queued.try_recv() {
            Ok(DecodeJob::Media { frame_type, frame, .. }) => {
                assert_eq!(frame_type, key);
                assert_eq!(frame.timestamp_us, 66_666);
            }
            _ => panic!("expected the next key frame"),
        }
        pipeline.media(channel, delta, video_frame(100_000, false).into());
        assert!(matches!(
            queued.try_recv(),
            Ok(DecodeJob::Media { frame_type, .. }) if frame_type == delta
        ));
        assert_eq!(lock_or_recover(&pipeline.stats).decode_queue_dropped, 1);

        // One request when the config applied, one for the dropped frame.
        for _ in 0..2 {
            let bytes = tokio::time::timeout(Duration::from_secs(2), requests.recv())
                .await
                .unwrap()
                .unwrap();
            let packet = wire::decode(bytes).unwrap();
            assert_eq!(
                ControlMessage::from_slice(&packet.payload).unwrap(),
                ControlMessage::RequestKeyFrame { channel_name: channel }
            );
        }
    }

    #[tokio::test]
    async fn fec_settings_are_kept_for_later_channels() {
        let fec = FecSettings {
            window: Duration::from_millis(120),
            max_blocks: 4,
            ..FecSettings::default()
        };
        let (subscriber, _publisher) = pair(SubscriberConfig::default(), None).await;
        let subscriber = subscriber.with_fec(fec.clone());
        assert_eq!(subscriber.fec, fec);
    }
}
