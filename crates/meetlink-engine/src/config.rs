use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

use crate::transport::TransportKind;
use meetlink_transport::channel::BackpressureConfig;
use meetlink_transport::fec::FecPolicy;
use meetlink_transport::jitter::PlayoutConfig;
use meetlink_transport::reconnect::BackoffPolicy;
use meetlink_transport::wire::{ChannelName, VideoTier};

pub const CONFIG_VERSION: u32 = 1;

// ─── Input (as written in TOML) ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfigInput {
    pub version: u32,
    pub transport: TransportConfigInput,
    pub reconnect: ReconnectConfigInput,
    pub fec: FecConfigInput,
    pub backpressure: BackpressureConfigInput,
    pub publisher: PublisherConfigInput,
    pub subscriber: SubscriberConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfigInput {
    pub kind: Option<TransportKind>,
    /// `host:port` for the stream transport, `ws://…` for the socket one.
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReconnectConfigInput {
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FecConfigInput {
    pub enabled: Option<bool>,
    pub symbol_size: Option<u16>,
    pub min_payload_len: Option<usize>,
    pub ratio: Option<f64>,
    pub min_repair: Option<u32>,
    pub max_repair: Option<u32>,
    pub min_config_repair: Option<u32>,
    pub window_ms: Option<u64>,
    pub max_blocks: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackpressureConfigInput {
    pub high_water: Option<usize>,
    pub low_water: Option<usize>,
    pub max_queued_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PublisherConfigInput {
    pub source: Option<StreamSource>,
    pub codec: Option<String>,
    pub key_frame_interval: Option<u64>,
    pub max_encode_queue: Option<usize>,
    pub switch_grace_ms: Option<u64>,
    pub tiers: Vec<TierConfigInput>,
    pub audio: AudioConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TierConfigInput {
    pub tier: Option<VideoTier>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub bitrate: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AudioConfigInput {
    pub enabled: Option<bool>,
    pub codec: Option<String>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub bitrate: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubscriberConfigInput {
    pub source: Option<StreamSource>,
    pub tier: Option<VideoTier>,
    pub is_own_stream: Option<bool>,
    pub jitter_delay_ms: Option<u64>,
    pub late_threshold_ms: Option<u64>,
    pub max_playout_frames: Option<usize>,
    pub gate_capacity: Option<usize>,
}

// ─── Resolved ───────────────────────────────────────────────────────────────

/// Which family of channels a stream uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSource {
    #[default]
    Camera,
    Screen,
}

impl StreamSource {
    pub fn video_channel(self, tier: VideoTier) -> ChannelName {
        match self {
            StreamSource::Camera => ChannelName::Camera(tier),
            StreamSource::Screen => ChannelName::Screen(tier),
        }
    }

    pub fn audio_channel(self) -> ChannelName {
        match self {
            StreamSource::Camera => ChannelName::Microphone,
            StreamSource::Screen => ChannelName::ScreenAudio,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub endpoint: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Stream,
            endpoint: "127.0.0.1:7400".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FecSettings {
    pub policy: FecPolicy,
    /// How long a partially received block may wait for more symbols.
    pub window: Duration,
    pub max_blocks: usize,
}

impl Default for FecSettings {
    fn default() -> Self {
        Self {
            policy: FecPolicy::default(),
            window: Duration::from_millis(500),
            max_blocks: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TierConfig {
    pub tier: VideoTier,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub bitrate: u32,
}

impl TierConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConfig {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            codec: "opus".to_string(),
            sample_rate: 48_000,
            channels: 1,
            bitrate: 32_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublisherConfig {
    pub source: StreamSource,
    pub codec: String,
    pub key_frame_interval: u64,
    /// Frames allowed in flight per tier encoder before new ones are dropped.
    pub max_encode_queue: usize,
    /// Pause before a replaced capture reader is discarded.
    pub switch_grace: Duration,
    pub tiers: Vec<TierConfig>,
    /// `None` publishes video only.
    pub audio: Option<AudioConfig>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            source: StreamSource::Camera,
            codec: "vp8".to_string(),
            key_frame_interval: 60,
            max_encode_queue: 2,
            switch_grace: Duration::from_millis(100),
            tiers: default_tiers(),
            audio: Some(AudioConfig::default()),
        }
    }
}

fn default_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig {
            tier: VideoTier::Low,
            width: 320,
            height: 180,
            frame_rate: 15.0,
            bitrate: 150_000,
        },
        TierConfig {
            tier: VideoTier::High,
            width: 1280,
            height: 720,
            frame_rate: 30.0,
            bitrate: 1_500_000,
        },
    ]
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberConfig {
    pub source: StreamSource,
    pub tier: VideoTier,
    /// Own loop-back stream: never mixed into audio output.
    pub is_own_stream: bool,
    pub playout: PlayoutConfig,
    /// Media packets held per channel while waiting for its config.
    pub gate_capacity: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            source: StreamSource::Camera,
            tier: VideoTier::High,
            is_own_stream: false,
            playout: PlayoutConfig::default(),
            gate_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub version: u32,
    pub transport: TransportConfig,
    pub reconnect: BackoffPolicy,
    pub fec: FecSettings,
    pub backpressure: BackpressureConfig,
    pub publisher: PublisherConfig,
    pub subscriber: SubscriberConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            transport: TransportConfig::default(),
            reconnect: BackoffPolicy::default(),
            fec: FecSettings::default(),
            backpressure: BackpressureConfig::default(),
            publisher: PublisherConfig::default(),
            subscriber: SubscriberConfig::default(),
        }
    }
}

// ─── Resolution ─────────────────────────────────────────────────────────────

impl EngineConfigInput {
    pub fn resolve(self) -> Result<EngineConfig, String> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(format!("Unsupported config version {}", version));
        }

        Ok(EngineConfig {
            version,
            transport: self.transport.resolve()?,
            reconnect: self.reconnect.resolve()?,
            fec: self.fec.resolve()?,
            backpressure: self.backpressure.resolve()?,
            publisher: self.publisher.resolve()?,
            subscriber: self.subscriber.resolve()?,
        })
    }
}

impl TransportConfigInput {
    fn resolve(self) -> Result<TransportConfig, String> {
        let kind = self.kind.unwrap_or(TransportKind::Stream);
        let endpoint = match self.endpoint.map(|e| e.trim().to_string()) {
            Some(e) if !e.is_empty() => e,
            _ => match kind {
                TransportKind::Stream => TransportConfig::default().endpoint,
                TransportKind::Socket => "ws://127.0.0.1:7400".to_string(),
                TransportKind::DataChannel => String::new(),
            },
        };
        if kind == TransportKind::Socket && !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(format!("Invalid URL for socket transport: {}", endpoint));
        }
        Ok(TransportConfig { kind, endpoint })
    }
}

impl ReconnectConfigInput {
    fn resolve(self) -> Result<BackoffPolicy, String> {
        let defaults = BackoffPolicy::default();
        let base = self
            .base_delay_ms
            .map_or(defaults.base, Duration::from_millis);
        let max = self.max_delay_ms.map_or(defaults.max, Duration::from_millis);
        if base.is_zero() {
            return Err("reconnect.base_delay_ms must be positive".to_string());
        }
        if max < base {
            return Err(format!(
                "reconnect.max_delay_ms ({}) is below base_delay_ms ({})",
                max.as_millis(),
                base.as_millis()
            ));
        }
        Ok(BackoffPolicy {
            base,
            max,
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
        })
    }
}

impl FecConfigInput {
    fn resolve(self) -> Result<FecSettings, String> {
        let defaults = FecSettings::default();
        let d = &defaults.policy;
        let policy = FecPolicy {
            enabled: self.enabled.unwrap_or(d.enabled),
            symbol_size: self.symbol_size.unwrap_or(d.symbol_size),
            min_payload_len: self.min_payload_len.unwrap_or(d.min_payload_len),
            ratio: self.ratio.unwrap_or(d.ratio),
            min_repair: self.min_repair.unwrap_or(d.min_repair),
            max_repair: self.max_repair.unwrap_or(d.max_repair),
            min_config_repair: self.min_config_repair.unwrap_or(d.min_config_repair),
        };
        if policy.symbol_size == 0 {
            return Err("fec.symbol_size must be positive".to_string());
        }
        if !(policy.ratio.is_finite() && policy.ratio >= 0.0) {
            return Err(format!("fec.ratio must be a non-negative number, got {}", policy.ratio));
        }
        if policy.min_repair > policy.max_repair {
            return Err(format!(
                "fec.min_repair ({}) exceeds max_repair ({})",
                policy.min_repair, policy.max_repair
            ));
        }
        Ok(FecSettings {
            policy,
            window: self.window_ms.map_or(defaults.window, Duration::from_millis),
            max_blocks: self.max_blocks.unwrap_or(defaults.max_blocks).max(1),
        })
    }
}

impl BackpressureConfigInput {
    fn resolve(self) -> Result<BackpressureConfig, String> {
        let d = BackpressureConfig::default();
        let cfg = BackpressureConfig {
            high_water: self.high_water.unwrap_or(d.high_water),
            low_water: self.low_water.unwrap_or(d.low_water),
            max_queued_bytes: self.max_queued_bytes.unwrap_or(d.max_queued_bytes),
        };
        if cfg.low_water >= cfg.high_water {
            return Err(format!(
                "backpressure.low_water ({}) must be below high_water ({})",
                cfg.low_water, cfg.high_water
            ));
        }
        if cfg.max_queued_bytes == 0 {
            return Err("backpressure.max_queued_bytes must be positive".to_string());
        }
        Ok(cfg)
    }
}

impl PublisherConfigInput {
    fn resolve(self) -> Result<PublisherConfig, String> {
        let defaults = PublisherConfig::default();

        let tiers = if self.tiers.is_empty() {
            defaults.tiers.clone()
        } else {
            let mut seen = HashSet::new();
            let mut out = Vec::with_capacity(self.tiers.len());
            for (idx, tier) in self.tiers.into_iter().enumerate() {
                let resolved = tier.resolve(idx)?;
                if !seen.insert(resolved.tier) {
                    return Err(format!("duplicate publisher tier {}", resolved.tier));
                }
                out.push(resolved);
            }
            out
        };

        let audio = if self.audio.enabled.unwrap_or(true) {
            let d = AudioConfig::default();
            let sample_rate = self.audio.sample_rate.unwrap_or(d.sample_rate);
            let channels = self.audio.channels.unwrap_or(d.channels);
            if sample_rate == 0 || channels == 0 {
                return Err("publisher.audio sample_rate and channels must be positive".to_string());
            }
            Some(AudioConfig {
                codec: self.audio.codec.unwrap_or(d.codec),
                sample_rate,
                channels,
                bitrate: self.audio.bitrate.unwrap_or(d.bitrate),
            })
        } else {
            None
        };

        Ok(PublisherConfig {
            source: self.source.unwrap_or(defaults.source),
            codec: self.codec.unwrap_or(defaults.codec),
            key_frame_interval: self.key_frame_interval.unwrap_or(defaults.key_frame_interval).max(1),
            max_encode_queue: self.max_encode_queue.unwrap_or(defaults.max_encode_queue).max(1),
            switch_grace: self
                .switch_grace_ms
                .map_or(defaults.switch_grace, Duration::from_millis),
            tiers,
            audio,
        })
    }
}

impl TierConfigInput {
    fn resolve(self, idx: usize) -> Result<TierConfig, String> {
        let tier = match self.tier {
            Some(t) => t,
            None => VideoTier::from_index(idx as u8).ok_or_else(|| format!("publisher.tiers[{}] needs a tier", idx))?,
        };
        let width = self.width.unwrap_or(640);
        let height = self.height.unwrap_or(360);
        let frame_rate = self.frame_rate.unwrap_or(30.0);
        if width == 0 || height == 0 {
            return Err(format!("tier {} has an empty resolution", tier));
        }
        if !(frame_rate.is_finite() && frame_rate > 0.0 && frame_rate <= 240.0) {
            return Err(format!("tier {} frame_rate {} out of range", tier, frame_rate));
        }
        Ok(TierConfig {
            tier,
            width,
            height,
            frame_rate,
            bitrate: self.bitrate.unwrap_or(500_000),
        })
    }
}

impl SubscriberConfigInput {
    fn resolve(self) -> Result<SubscriberConfig, String> {
        let d = SubscriberConfig::default();
        let playout = PlayoutConfig {
            jitter_delay: self
                .jitter_delay_ms
                .map_or(d.playout.jitter_delay, Duration::from_millis),
            late_threshold: self
                .late_threshold_ms
                .map_or(d.playout.late_threshold, Duration::from_millis),
            max_frames: self.max_playout_frames.unwrap_or(d.playout.max_frames).max(1),
        };
        Ok(SubscriberConfig {
            source: self.source.unwrap_or(d.source),
            tier: self.tier.unwrap_or(d.tier),
            is_own_stream: self.is_own_stream.unwrap_or(d.is_own_stream),
            playout,
            gate_capacity: self.gate_capacity.unwrap_or(d.gate_capacity).max(1),
        })
    }
}

impl EngineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(EngineConfig::default());
        }
        let parsed: EngineConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))?;
        parsed.resolve()
    }
}
