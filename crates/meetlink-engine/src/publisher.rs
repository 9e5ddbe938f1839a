//! # Publisher
//!
//! Capture → encode → frame → (FEC) → send, over one control channel and one
//! channel per video tier plus an audio channel.
//!
//! Each tier has a trigger-paced reader task that pulls the latest frame from
//! the video track and hands it to the tier's encoder thread through a
//! bounded crossbeam queue. A full queue drops the frame; capture is never
//! blocked. Encoder threads put their output straight on the channel
//! registry, sending the channel's decoder config first.
//!
//! Device switches swap only the track and its readers; channels, encoders
//! and sequence counters stay as they are.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{AudioConfig, PublisherConfig, StreamSource, TierConfig};
use crate::error::{EngineError, MediaError, TransportError, TransportErrorKind};
use crate::media::{
    is_valid_audio_chunk, AudioBuffer, AudioEncoder, AudioEncoderFactory, AudioTrack, CaptureConstraints,
    CaptureDevice, EncodedAudio, EncodedVideo, MediaStream, VideoEncoder, VideoEncoderFactory,
    VideoEncoderSettings, VideoFrame, VideoTrack,
};
use crate::registry::{ChannelHandle, ChannelRegistry};
use crate::session::TransportSession;
use crate::util::lock_or_recover;
use meetlink_common::protocol::{AudioDecoderConfig, ControlMessage, DeviceKind, StreamConfig};
use meetlink_transport::clock::MediaClock;
use meetlink_transport::reconnect::SessionEvent;
use meetlink_transport::stats::PublisherStats;
use meetlink_transport::wire::{self, ChannelName, FrameType, MediaFrame};

const STATUS_CAPACITY: usize = 64;
const AUDIO_QUEUE: usize = 16;

/// Status notifications. Errors here never stop the publisher.
#[derive(Debug, Clone, PartialEq)]
pub enum PublisherStatus {
    Session(SessionEvent),
    /// Capture came up with fewer tracks than configured.
    CaptureFallback { video: bool, audio: bool },
    ConfigSent(ChannelName),
    EncodeError { channel: ChannelName, error: String },
    SendError { channel: ChannelName, error: String },
    /// A subscriber's key-frame or tier request was honoured.
    RemoteRequest(ControlMessage),
    DeviceSwitched(DeviceKind),
    Stopped,
}

/// The media collaborators a publisher drives.
#[derive(Clone)]
pub struct MediaBackends {
    pub capture: Arc<dyn CaptureDevice>,
    pub video_encoders: Arc<dyn VideoEncoderFactory>,
    pub audio_encoders: Arc<dyn AudioEncoderFactory>,
}

impl MediaBackends {
    pub fn synthetic() -> Self {
        use crate::media::synthetic::*;
        MediaBackends {
            capture: Arc::new(SyntheticCapture::default()),
            video_encoders: Arc::new(SyntheticVideoEncoderFactory::default()),
            audio_encoders: Arc::new(SyntheticAudioEncoderFactory),
        }
    }
}

// ─── Outlet ─────────────────────────────────────────────────────────────────

/// Everything an encoder thread needs to put output on the wire.
#[derive(Clone)]
struct Outlet {
    registry: ChannelRegistry,
    status: broadcast::Sender<PublisherStatus>,
    stats: Arc<Mutex<PublisherStats>>,
    clock: Arc<Mutex<MediaClock>>,
    /// Latest config per channel, for the `DecoderConfigs` aggregate.
    configs: Arc<Mutex<HashMap<ChannelName, StreamConfig>>>,
}

impl Outlet {
    fn emit(&self, status: PublisherStatus) {
        let _ = self.status.send(status);
    }

    /// Make sure the channel's decoder config is on the wire. Returns false
    /// while it cannot be sent (not connected), so media must wait.
    fn ensure_config(&self, config: StreamConfig) -> bool {
        let channel = config.channel_name;
        if self.registry.is_config_sent(channel) {
            return true;
        }
        let bytes = match ControlMessage::StreamConfig(config.clone()).to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(%channel, error = %e, "failed to serialize decoder config");
                return false;
            }
        };
        lock_or_recover(&self.configs).insert(channel, config);
        match self.registry.send_config(channel, bytes) {
            Ok(true) => {
                tracing::info!(%channel, "decoder config sent");
                self.emit(PublisherStatus::ConfigSent(channel));
                self.send_aggregate();
                true
            }
            Ok(false) => false,
            Err(e) => {
                self.send_failed(channel, &e);
                false
            }
        }
    }

    /// Every known config on the control channel, for late joiners.
    fn send_aggregate(&self) {
        let mut configs: Vec<StreamConfig> = lock_or_recover(&self.configs).values().cloned().collect();
        configs.sort_by_key(|c| c.channel_name.id());
        let message = ControlMessage::DecoderConfigs { configs };
        let result = message
            .to_bytes()
            .map_err(|e| TransportError::protocol(e.to_string()))
            .and_then(|bytes| self.registry.send_frame(ChannelName::Control, message.frame_type(), &bytes));
        if let Err(e) = result {
            tracing::debug!(error = %e, "decoder config aggregate not sent");
        }
    }

    fn send_media(&self, channel: ChannelName, frame_type: FrameType, timestamp_us: u32, data: Bytes) -> bool {
        let payload = MediaFrame { timestamp_us, data }.encode();
        match self.registry.send_frame(channel, frame_type, &payload) {
            Ok(_) => true,
            Err(e) => {
                self.send_failed(channel, &e);
                false
            }
        }
    }

    fn send_failed(&self, channel: ChannelName, e: &TransportError) {
        match e.kind {
            TransportErrorKind::NotConnected => {
                tracing::debug!(%channel, "not connected, dropping output");
            }
            TransportErrorKind::CapacityExceeded => {
                lock_or_recover(&self.stats).frames_dropped_backpressure += 1;
                tracing::warn!(%channel, error = %e, "outbound queue full");
                self.emit(PublisherStatus::SendError {
                    channel,
                    error: e.to_string(),
                });
            }
            _ => {
                tracing::warn!(%channel, error = %e, "send failed");
                self.emit(PublisherStatus::SendError {
                    channel,
                    error: e.to_string(),
                });
            }
        }
    }

    fn encode_failed(&self, channel: ChannelName, e: &MediaError) {
        lock_or_recover(&self.stats).encode_errors += 1;
        tracing::warn!(%channel, error = %e, "encode failed");
        self.emit(PublisherStatus::EncodeError {
            channel,
            error: e.to_string(),
        });
    }
}

// ─── Encoder threads ────────────────────────────────────────────────────────

struct EncodeJob {
    frame: VideoFrame,
    key_frame: bool,
}

fn video_encode_worker(
    channel: ChannelName,
    mut encoder: Box<dyn VideoEncoder>,
    jobs: Receiver<EncodeJob>,
    in_flight: Arc<AtomicUsize>,
    outlet: Outlet,
) {
    for job in jobs.iter() {
        let result = encoder.encode(&job.frame, job.key_frame);
        in_flight.fetch_sub(1, Ordering::AcqRel);
        match result {
            Ok(units) => {
                for unit in units {
                    deliver_video(&outlet, channel, encoder.as_ref(), unit);
                }
            }
            Err(e) => outlet.encode_failed(channel, &e),
        }
    }

    // Every sender is gone: flush and exit.
    match encoder.flush() {
        Ok(units) => {
            for unit in units {
                deliver_video(&outlet, channel, encoder.as_ref(), unit);
            }
        }
        Err(e) => outlet.encode_failed(channel, &e),
    }
    tracing::debug!(%channel, "video encoder stopped");
}

fn deliver_video(outlet: &Outlet, channel: ChannelName, encoder: &dyn VideoEncoder, unit: EncodedVideo) {
    if !outlet.registry.is_config_sent(channel) {
        let Some(config) = encoder.decoder_config() else {
            tracing::debug!(%channel, "decoder config not available yet, holding back output");
            return;
        };
        if !outlet.ensure_config(StreamConfig::video(channel, config)) {
            return;
        }
    }
    let Some(frame_type) = FrameType::video(channel, unit.key_frame) else {
        return;
    };
    let timestamp = lock_or_recover(&outlet.clock).video_timestamp(unit.timestamp_us);
    if outlet.send_media(channel, frame_type, timestamp, unit.data) {
        let mut stats = lock_or_recover(&outlet.stats);
        stats.frames_encoded += 1;
        if unit.key_frame {
            stats.key_frames += 1;
        }
    }
}

/// Audio encoder thread state: the first valid chunk becomes the decoder
/// config description; later chunks are stamped from the sample counter.
struct AudioSink {
    channel: ChannelName,
    audio: AudioConfig,
    config: Option<StreamConfig>,
    sample_count: u64,
    outlet: Outlet,
}

impl AudioSink {
    fn deliver(&mut self, chunk: EncodedAudio) {
        if !is_valid_audio_chunk(&chunk.data) {
            lock_or_recover(&self.outlet.stats).audio_chunks_invalid += 1;
            tracing::debug!(channel = %self.channel, len = chunk.data.len(), "dropping audio chunk without Ogg magic");
            return;
        }

        let Some(config) = &self.config else {
            let config = StreamConfig::audio(
                self.channel,
                AudioDecoderConfig {
                    codec: self.audio.codec.clone(),
                    sample_rate: self.audio.sample_rate,
                    channel_count: self.audio.channels,
                    description: Some(chunk.data.to_vec()),
                },
            );
            self.outlet.ensure_config(config.clone());
            self.config = Some(config);
            return;
        };

        if !self.outlet.ensure_config(config.clone()) {
            return;
        }
        let timestamp = lock_or_recover(&self.outlet.clock).audio_timestamp(self.sample_count, self.audio.sample_rate);
        self.sample_count += chunk.samples as u64;
        if self.outlet.send_media(self.channel, FrameType::Audio, timestamp, chunk.data) {
            lock_or_recover(&self.outlet.stats).audio_chunks += 1;
        }
    }
}

fn audio_encode_worker(mut encoder: Box<dyn AudioEncoder>, jobs: Receiver<AudioBuffer>, mut sink: AudioSink) {
    for buffer in jobs.iter() {
        match encoder.encode(&buffer) {
            Ok(chunks) => chunks.into_iter().for_each(|c| sink.deliver(c)),
            Err(e) => sink.outlet.encode_failed(sink.channel, &e),
        }
    }
    match encoder.flush() {
        Ok(chunks) => chunks.into_iter().for_each(|c| sink.deliver(c)),
        Err(e) => sink.outlet.encode_failed(sink.channel, &e),
    }
    tracing::debug!(channel = %sink.channel, "audio encoder stopped");
}

fn spawn_worker(name: String, f: impl FnOnce() + Send + 'static) -> Result<thread::JoinHandle<()>, MediaError> {
    thread::Builder::new()
        .name(name)
        .spawn(f)
        .map_err(|e| MediaError::Encode(format!("failed to spawn encoder thread: {e}")))
}

// ─── Capture readers ────────────────────────────────────────────────────────

/// Per-tier state shared by its reader, the control listener and commands.
struct TierShared {
    config: TierConfig,
    channel: ChannelName,
    force_key: AtomicBool,
    frames: AtomicU64,
    in_flight: Arc<AtomicUsize>,
}

struct ReaderContext {
    tier: Arc<TierShared>,
    jobs: Sender<EncodeJob>,
    max_queue: usize,
    key_frame_interval: u64,
    enabled: Arc<AtomicBool>,
    stats: Arc<Mutex<PublisherStats>>,
}

async fn video_reader(track: Arc<dyn VideoTrack>, ctx: ReaderContext) {
    let tier = &ctx.tier;
    let mut ticker = tokio::time::interval(tier.config.frame_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(frame) = track.latest_frame() else {
            continue;
        };
        lock_or_recover(&ctx.stats).frames_captured += 1;
        if !ctx.enabled.load(Ordering::Acquire) {
            continue;
        }

        let n = tier.frames.fetch_add(1, Ordering::AcqRel);
        let forced = tier.force_key.swap(false, Ordering::AcqRel);
        let key_frame = forced || n % ctx.key_frame_interval == 0;

        if tier.in_flight.load(Ordering::Acquire) >= ctx.max_queue {
            drop_frame(&ctx, key_frame);
            continue;
        }
        tier.in_flight.fetch_add(1, Ordering::AcqRel);
        match ctx.jobs.try_send(EncodeJob { frame, key_frame }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tier.in_flight.fetch_sub(1, Ordering::AcqRel);
                drop_frame(&ctx, key_frame);
            }
            Err(TrySendError::Disconnected(_)) => {
                tier.in_flight.fetch_sub(1, Ordering::AcqRel);
                return;
            }
        }
    }
}

fn drop_frame(ctx: &ReaderContext, key_frame: bool) {
    lock_or_recover(&ctx.stats).frames_dropped_backpressure += 1;
    if key_frame {
        // The key frame is still owed.
        ctx.tier.force_key.store(true, Ordering::Release);
    }
    tracing::trace!(channel = %ctx.tier.channel, "encoder busy, frame dropped");
}

async fn audio_reader(
    track: Arc<dyn AudioTrack>,
    jobs: Sender<AudioBuffer>,
    enabled: Arc<AtomicBool>,
    stats: Arc<Mutex<PublisherStats>>,
) {
    while let Some(buffer) = track.read().await {
        if !enabled.load(Ordering::Acquire) {
            continue;
        }
        match jobs.try_send(buffer) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                lock_or_recover(&stats).frames_dropped_backpressure += 1;
            }
            Err(TrySendError::Disconnected(_)) => return,
        }
    }
    tracing::debug!("audio track ended");
}

// ─── Background tasks ───────────────────────────────────────────────────────

async fn forward_session_events(
    mut events: broadcast::Receiver<SessionEvent>,
    tiers: Vec<Arc<TierShared>>,
    outlet: Outlet,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if event == SessionEvent::Reconnected {
                    // Receivers on the new connection need a fresh key frame.
                    force_key_frames(&tiers);
                }
                outlet.emit(PublisherStatus::Session(event));
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "session events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn control_listener(control: ChannelHandle, tiers: Vec<Arc<TierShared>>, outlet: Outlet) {
    while let Some(bytes) = control.recv().await {
        let packet = match wire::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(error = %e, "dropping malformed control packet");
                continue;
            }
        };
        if packet.is_fec() {
            tracing::debug!(seq = packet.sequence, "ignoring FEC symbol on control channel");
            continue;
        }
        let message = match ControlMessage::from_slice(&packet.payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "dropping unreadable control message");
                continue;
            }
        };

        match &message {
            ControlMessage::RequestKeyFrame { channel_name } => {
                let Some(tier) = tiers.iter().find(|t| t.channel == *channel_name) else {
                    tracing::debug!(channel = %channel_name, "key frame requested for unpublished channel");
                    continue;
                };
                tier.force_key.store(true, Ordering::Release);
            }
            ControlMessage::RequestTier { tier } => {
                let Some(shared) = tiers.iter().find(|t| t.config.tier == *tier) else {
                    tracing::warn!(%tier, "requested tier is not published");
                    continue;
                };
                // The new viewer needs the config and a key frame.
                outlet.registry.reset_config(shared.channel);
                shared.force_key.store(true, Ordering::Release);
            }
            other => {
                tracing::debug!(?other, "ignoring control message");
                continue;
            }
        }
        tracing::info!(?message, "subscriber request");
        outlet.emit(PublisherStatus::RemoteRequest(message));
    }
}

fn force_key_frames(tiers: &[Arc<TierShared>]) {
    for tier in tiers {
        tier.force_key.store(true, Ordering::Release);
    }
}

// ─── Publisher ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Phase {
    #[default]
    Idle,
    Started,
    Stopped,
}

#[derive(Default)]
struct PublisherState {
    phase: Phase,
    stream: MediaStream,
    tiers: Vec<Arc<TierShared>>,
    tier_jobs: Vec<Sender<EncodeJob>>,
    audio_jobs: Option<Sender<AudioBuffer>>,
    workers: Vec<thread::JoinHandle<()>>,
    video_readers: Vec<JoinHandle<()>>,
    audio_reader: Option<JoinHandle<()>>,
    control_task: Option<JoinHandle<()>>,
    status_task: Option<JoinHandle<()>>,
}

pub struct Publisher {
    config: PublisherConfig,
    session: TransportSession,
    backends: MediaBackends,
    outlet: Outlet,
    video_enabled: Arc<AtomicBool>,
    audio_enabled: Arc<AtomicBool>,
    state: Mutex<PublisherState>,
}

impl Publisher {
    pub fn new(config: PublisherConfig, session: TransportSession, backends: MediaBackends) -> Self {
        let (status, _) = broadcast::channel(STATUS_CAPACITY);
        let outlet = Outlet {
            registry: session.registry().clone(),
            status,
            stats: Arc::default(),
            clock: Arc::default(),
            configs: Arc::default(),
        };
        Publisher {
            config,
            session,
            backends,
            outlet,
            video_enabled: Arc::new(AtomicBool::new(true)),
            audio_enabled: Arc::new(AtomicBool::new(true)),
            state: Mutex::new(PublisherState::default()),
        }
    }

    pub fn session(&self) -> &TransportSession {
        &self.session
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublisherStatus> {
        self.outlet.status.subscribe()
    }

    pub fn stats(&self) -> PublisherStats {
        lock_or_recover(&self.outlet.stats).clone()
    }

    /// Channels this publisher has open.
    pub fn channels(&self) -> Vec<ChannelName> {
        self.session.registry().open_channels()
    }

    /// Connect, acquire capture, open channels and start encoding.
    ///
    /// On error the publisher keeps whatever was started; call
    /// [`Publisher::stop`] to release it.
    pub async fn start(&self) -> Result<(), EngineError> {
        {
            let mut state = lock_or_recover(&self.state);
            if state.phase != Phase::Idle {
                return Err(EngineError::State("publisher already started"));
            }
            state.phase = Phase::Started;
        }

        let session_events = self.session.subscribe();
        self.session.connect().await?;

        let stream = self.acquire().await?;
        lock_or_recover(&self.state).stream = stream.clone();

        let registry = self.session.registry().clone();
        let control = registry.open(ChannelName::Control).await?;

        if stream.video.is_some() {
            for tier in &self.config.tiers {
                self.start_tier(&registry, tier).await?;
            }
        }
        if let (Some(_), Some(audio)) = (&stream.audio, &self.config.audio) {
            self.start_audio(&registry, audio).await?;
        }

        let tiers = lock_or_recover(&self.state).tiers.clone();
        let status_task = tokio::spawn(forward_session_events(session_events, tiers.clone(), self.outlet.clone()));
        let control_task = tokio::spawn(control_listener(control, tiers, self.outlet.clone()));

        let mut state = lock_or_recover(&self.state);
        state.status_task = Some(status_task);
        state.control_task = Some(control_task);
        if state.phase != Phase::Started {
            return Err(EngineError::State("publisher stopped while starting"));
        }
        if let Some(track) = stream.video.clone() {
            state.video_readers = self.spawn_video_readers(&state, track);
        }
        if let Some(track) = stream.audio.clone() {
            state.audio_reader = self.spawn_audio_reader(&state, track);
        }
        tracing::info!(
            tiers = state.tiers.len(),
            audio = state.audio_jobs.is_some(),
            "publisher started"
        );
        Ok(())
    }

    /// Capture with fallback: everything configured, then video only, then
    /// audio only.
    async fn acquire(&self) -> Result<MediaStream, EngineError> {
        let want_video = !self.config.tiers.is_empty();
        let want_audio = self.config.audio.is_some();
        if !want_video && !want_audio {
            return Err(EngineError::State("nothing to publish"));
        }

        let capture = &self.backends.capture;
        let full = CaptureConstraints {
            video: want_video,
            audio: want_audio,
            ..CaptureConstraints::default()
        };
        let mut last_error = match capture.acquire(&full).await {
            Ok(stream) => return Ok(stream),
            Err(e) if want_video && want_audio => e,
            Err(e) => return Err(e.into()),
        };
        tracing::warn!(error = %last_error, "capture failed, trying single tracks");

        for (video, audio) in [(true, false), (false, true)] {
            let constraints = CaptureConstraints {
                video,
                audio,
                ..CaptureConstraints::default()
            };
            match capture.acquire(&constraints).await {
                Ok(stream) => {
                    tracing::warn!(video, audio, "publishing with reduced capture");
                    self.outlet.emit(PublisherStatus::CaptureFallback { video, audio });
                    return Ok(stream);
                }
                Err(e) => last_error = e,
            }
        }
        Err(last_error.into())
    }

    async fn start_tier(&self, registry: &ChannelRegistry, tier: &TierConfig) -> Result<(), EngineError> {
        let channel = self.config.source.video_channel(tier.tier);
        registry.open(channel).await?;
        let encoder = self.backends.video_encoders.create(&VideoEncoderSettings {
            codec: self.config.codec.clone(),
            width: tier.width,
            height: tier.height,
            frame_rate: tier.frame_rate,
            bitrate: tier.bitrate,
        })?;

        let (jobs, rx) = bounded(self.config.max_encode_queue);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let worker = {
            let in_flight = in_flight.clone();
            let outlet = self.outlet.clone();
            spawn_worker(format!("meetlink-enc-{channel}"), move || {
                video_encode_worker(channel, encoder, rx, in_flight, outlet)
            })?
        };

        let mut state = lock_or_recover(&self.state);
        state.workers.push(worker);
        state.tier_jobs.push(jobs);
        state.tiers.push(Arc::new(TierShared {
            config: tier.clone(),
            channel,
            force_key: AtomicBool::new(false),
            frames: AtomicU64::new(0),
            in_flight,
        }));
        tracing::debug!(%channel, width = tier.width, height = tier.height, "tier pipeline ready");
        Ok(())
    }

    async fn start_audio(&self, registry: &ChannelRegistry, audio: &AudioConfig) -> Result<(), EngineError> {
        let channel = self.config.source.audio_channel();
        registry.open(channel).await?;
        let encoder = self
            .backends
            .audio_encoders
            .create(audio.sample_rate, audio.channels, audio.bitrate)?;
        let (jobs, rx) = bounded(AUDIO_QUEUE);
        let sink = AudioSink {
            channel,
            audio: audio.clone(),
            config: None,
            sample_count: 0,
            outlet: self.outlet.clone(),
        };
        let worker = spawn_worker(format!("meetlink-enc-{channel}"), move || {
            audio_encode_worker(encoder, rx, sink)
        })?;

        let mut state = lock_or_recover(&self.state);
        state.workers.push(worker);
        state.audio_jobs = Some(jobs);
        Ok(())
    }

    fn spawn_video_readers(&self, state: &PublisherState, track: Arc<dyn VideoTrack>) -> Vec<JoinHandle<()>> {
        state
            .tiers
            .iter()
            .zip(&state.tier_jobs)
            .map(|(tier, jobs)| {
                let ctx = ReaderContext {
                    tier: tier.clone(),
                    jobs: jobs.clone(),
                    max_queue: self.config.max_encode_queue,
                    key_frame_interval: self.config.key_frame_interval.max(1),
                    enabled: self.video_enabled.clone(),
                    stats: self.outlet.stats.clone(),
                };
                tokio::spawn(video_reader(track.clone(), ctx))
            })
            .collect()
    }

    fn spawn_audio_reader(&self, state: &PublisherState, track: Arc<dyn AudioTrack>) -> Option<JoinHandle<()>> {
        let jobs = state.audio_jobs.clone()?;
        Some(tokio::spawn(audio_reader(
            track,
            jobs,
            self.audio_enabled.clone(),
            self.outlet.stats.clone(),
        )))
    }

    // ─── Commands ───────────────────────────────────────────────────────────

    /// Send a control-channel event.
    pub fn send_event(&self, message: &ControlMessage) -> Result<(), EngineError> {
        let bytes = message.to_bytes()?;
        self.session
            .registry()
            .send_frame(ChannelName::Control, message.frame_type(), &bytes)?;
        Ok(())
    }

    pub fn set_video_enabled(&self, enabled: bool) -> Result<(), EngineError> {
        let was = self.video_enabled.swap(enabled, Ordering::AcqRel);
        if enabled && !was {
            force_key_frames(&lock_or_recover(&self.state).tiers);
        }
        self.send_event(&ControlMessage::VideoEnabled { enabled })
    }

    pub fn set_audio_enabled(&self, enabled: bool) -> Result<(), EngineError> {
        self.audio_enabled.store(enabled, Ordering::Release);
        self.send_event(&ControlMessage::AudioEnabled { enabled })
    }

    pub fn raise_hand(&self) -> Result<(), EngineError> {
        self.send_event(&ControlMessage::HandRaised)
    }

    pub fn lower_hand(&self) -> Result<(), EngineError> {
        self.send_event(&ControlMessage::HandLowered)
    }

    pub fn pin_for_everyone(&self, participant_id: impl Into<String>) -> Result<(), EngineError> {
        self.send_event(&ControlMessage::PinForEveryone {
            participant_id: participant_id.into(),
        })
    }

    pub fn unpin_for_everyone(&self, participant_id: impl Into<String>) -> Result<(), EngineError> {
        self.send_event(&ControlMessage::UnpinForEveryone {
            participant_id: participant_id.into(),
        })
    }

    /// Force the next frame of every tier to be a key frame.
    pub fn request_key_frame(&self) {
        force_key_frames(&lock_or_recover(&self.state).tiers);
    }

    // ─── Device switching ───────────────────────────────────────────────────

    pub async fn switch_camera(&self, camera_id: Option<String>) -> Result<(), EngineError> {
        let constraints = CaptureConstraints {
            video: true,
            camera_id,
            ..CaptureConstraints::default()
        };
        let stream = self.backends.capture.acquire(&constraints).await?;
        let track = stream
            .video
            .ok_or_else(|| MediaError::Capture("device returned no video track".into()))?;
        self.swap_video(track).await?;
        self.device_switched(match self.config.source {
            StreamSource::Camera => DeviceKind::Camera,
            StreamSource::Screen => DeviceKind::Screen,
        })
    }

    pub async fn switch_microphone(&self, microphone_id: Option<String>) -> Result<(), EngineError> {
        let constraints = CaptureConstraints {
            audio: true,
            microphone_id,
            ..CaptureConstraints::default()
        };
        let stream = self.backends.capture.acquire(&constraints).await?;
        let track = stream
            .audio
            .ok_or_else(|| MediaError::Capture("device returned no audio track".into()))?;
        self.swap_audio(track).await?;
        self.device_switched(DeviceKind::Microphone)
    }

    /// Replace whichever tracks `stream` carries.
    pub async fn replace_media_stream(&self, stream: MediaStream) -> Result<(), EngineError> {
        if stream.is_empty() {
            return Err(EngineError::State("replacement stream has no tracks"));
        }
        if let Some(video) = stream.video {
            self.swap_video(video).await?;
            self.device_switched(match self.config.source {
                StreamSource::Camera => DeviceKind::Camera,
                StreamSource::Screen => DeviceKind::Screen,
            })?;
        }
        if let Some(audio) = stream.audio {
            self.swap_audio(audio).await?;
            self.device_switched(DeviceKind::Microphone)?;
        }
        Ok(())
    }

    fn device_switched(&self, kind: DeviceKind) -> Result<(), EngineError> {
        self.outlet.emit(PublisherStatus::DeviceSwitched(kind));
        self.send_event(&ControlMessage::DeviceSwitched { kind })
    }

    async fn swap_video(&self, track: Arc<dyn VideoTrack>) -> Result<(), EngineError> {
        let (old_readers, old_track) = {
            let mut state = lock_or_recover(&self.state);
            if state.phase != Phase::Started {
                return Err(EngineError::State("publisher not started"));
            }
            if state.tiers.is_empty() {
                return Err(EngineError::State("publisher has no video pipeline"));
            }
            (std::mem::take(&mut state.video_readers), state.stream.video.take())
        };

        for reader in &old_readers {
            reader.abort();
        }
        // Let frames already handed to the encoders go out.
        tokio::time::sleep(self.config.switch_grace).await;
        if let Some(old) = old_track {
            old.stop();
        }
        lock_or_recover(&self.outlet.clock).rebase_video();

        let mut state = lock_or_recover(&self.state);
        if state.phase != Phase::Started {
            track.stop();
            return Err(EngineError::State("publisher stopped during switch"));
        }
        force_key_frames(&state.tiers);
        state.video_readers = self.spawn_video_readers(&state, track.clone());
        state.stream.video = Some(track);
        tracing::info!("video track replaced");
        Ok(())
    }

    async fn swap_audio(&self, track: Arc<dyn AudioTrack>) -> Result<(), EngineError> {
        let (old_reader, old_track) = {
            let mut state = lock_or_recover(&self.state);
            if state.phase != Phase::Started {
                return Err(EngineError::State("publisher not started"));
            }
            if state.audio_jobs.is_none() {
                return Err(EngineError::State("publisher has no audio pipeline"));
            }
            (state.audio_reader.take(), state.stream.audio.take())
        };

        if let Some(reader) = &old_reader {
            reader.abort();
        }
        tokio::time::sleep(self.config.switch_grace).await;
        if let Some(old) = old_track {
            old.stop();
        }

        let mut state = lock_or_recover(&self.state);
        if state.phase != Phase::Started {
            track.stop();
            return Err(EngineError::State("publisher stopped during switch"));
        }
        state.audio_reader = self.spawn_audio_reader(&state, track.clone());
        state.stream.audio = Some(track);
        tracing::info!("audio track replaced");
        Ok(())
    }

    // ─── Shutdown ───────────────────────────────────────────────────────────

    /// Stop capture, flush encoders, close channels and release the
    /// session, in that order. Idempotent; safe after a partial start.
    pub async fn stop(&self) {
        let taken = {
            let mut state = lock_or_recover(&self.state);
            if state.phase == Phase::Stopped {
                return;
            }
            let taken = std::mem::take(&mut *state);
            state.phase = Phase::Stopped;
            taken
        };

        let PublisherState {
            stream,
            tiers,
            tier_jobs,
            audio_jobs,
            workers,
            video_readers,
            audio_reader,
            control_task,
            status_task,
            ..
        } = taken;

        // Inputs first.
        let readers: Vec<_> = video_readers.into_iter().chain(audio_reader).collect();
        for reader in &readers {
            reader.abort();
        }
        for reader in readers {
            let _ = reader.await;
        }
        stream.stop();

        // Dropping the last job senders lets each encoder flush and exit.
        drop(tier_jobs);
        drop(audio_jobs);
        drop(tiers);
        if !workers.is_empty() {
            let joined = tokio::task::spawn_blocking(move || {
                for worker in workers {
                    if worker.join().is_err() {
                        tracing::warn!("encoder thread panicked");
                    }
                }
            })
            .await;
            if let Err(e) = joined {
                tracing::warn!(error = %e, "failed to join encoder threads");
            }
        }

        if let Some(task) = control_task {
            task.abort();
        }
        self.session.disconnect().await;
        if let Some(task) = status_task {
            task.abort();
        }

        self.outlet.emit(PublisherStatus::Stopped);
        tracing::info!("publisher stopped");
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        let state = lock_or_recover(&self.state);
        for task in state
            .video_readers
            .iter()
            .chain(&state.audio_reader)
            .chain(&state.control_task)
            .chain(&state.status_task)
        {
            task.abort();
        }
        state.stream.stop();
    }
}
