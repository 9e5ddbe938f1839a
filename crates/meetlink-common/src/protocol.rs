//! Control and configuration documents exchanged over meetlink channels.
//!
//! All documents are JSON with camelCase fields and a `type` discriminator.
//! Decoder configs travel as `Config` packets (on each media channel, and as
//! an aggregate on the control channel); everything else is an `Event`
//! packet on the control channel. Binary `description` fields are base64.

use bytes::Bytes;
use meetlink_transport::wire::{ChannelName, FrameType, VideoTier};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Decoder Configs ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MediaType {
    Video,
    Audio,
}

/// Everything a video decoder needs before the first key frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoDecoderConfig {
    pub codec: String,
    pub coded_width: u32,
    pub coded_height: u32,
    pub frame_rate: f64,
    /// Codec-specific extradata (e.g. avcC).
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
    pub description: Option<Vec<u8>>,
}

/// Everything an audio decoder needs before the first chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioDecoderConfig {
    pub codec: String,
    pub sample_rate: u32,
    pub channel_count: u16,
    /// Opus identification header (the first `OggS` page).
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
    pub description: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DecoderConfig {
    Video(VideoDecoderConfig),
    Audio(AudioDecoderConfig),
}

impl DecoderConfig {
    pub fn media_type(&self) -> MediaType {
        match self {
            DecoderConfig::Video(_) => MediaType::Video,
            DecoderConfig::Audio(_) => MediaType::Audio,
        }
    }
}

/// Decoder bootstrap for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    pub channel_name: ChannelName,
    pub media_type: MediaType,
    pub config: DecoderConfig,
}

impl StreamConfig {
    pub fn video(channel_name: ChannelName, config: VideoDecoderConfig) -> Self {
        StreamConfig {
            channel_name,
            media_type: MediaType::Video,
            config: DecoderConfig::Video(config),
        }
    }

    pub fn audio(channel_name: ChannelName, config: AudioDecoderConfig) -> Self {
        StreamConfig {
            channel_name,
            media_type: MediaType::Audio,
            config: DecoderConfig::Audio(config),
        }
    }
}

// ── Control Messages ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceKind {
    Camera,
    Microphone,
    Screen,
}

/// Every document carried in `Config` and `Event` packets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// Decoder config for the channel it is sent on.
    StreamConfig(StreamConfig),
    /// Every known config, for late joiners.
    DecoderConfigs { configs: Vec<StreamConfig> },
    VideoEnabled { enabled: bool },
    AudioEnabled { enabled: bool },
    HandRaised,
    HandLowered,
    PinForEveryone { participant_id: String },
    UnpinForEveryone { participant_id: String },
    /// Capture source swapped; a key frame follows.
    DeviceSwitched { kind: DeviceKind },
    /// Subscriber → publisher: send a key frame on this channel soon.
    RequestKeyFrame { channel_name: ChannelName },
    /// Subscriber → publisher: the subscriber is moving to this tier.
    RequestTier { tier: VideoTier },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid control document: {0}")]
    Json(#[from] serde_json::Error),
}

impl ControlMessage {
    /// Packet frame type this document travels as.
    pub fn frame_type(&self) -> FrameType {
        match self {
            ControlMessage::StreamConfig(_) | ControlMessage::DecoderConfigs { .. } => {
                FrameType::Config
            }
            _ => FrameType::Event,
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|s| BASE64.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
