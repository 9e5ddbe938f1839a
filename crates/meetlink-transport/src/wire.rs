//! # Meetlink Wire Format
//!
//! Fixed-width packet headers carried on every channel.
//!
//! ## Regular packet (6-byte header)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Sequence Number (32)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  FEC = 0x00   |  Frame Type   |          Payload ...          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! ## FEC symbol packet (20-byte header)
//!
//! ```text
//! | seq (32) | 0xFF | type | transfer length (64) | symbol size (16) |
//! | source blocks (8) | sub blocks (16) | alignment (8) | symbol ... |
//! ```
//!
//! All multi-byte integers are big-endian. Streams additionally wrap each
//! packet in a `[u32 length][packet]` frame (see [`encode_frame`]).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Regular header: 4 (seq) + 1 (fec flag) + 1 (type).
pub const REGULAR_HEADER_LEN: usize = 6;

/// FEC header: regular header + 14 config bytes.
pub const FEC_HEADER_LEN: usize = REGULAR_HEADER_LEN + FecConfig::ENCODED_LEN;

/// Byte offset of the FEC marker.
pub const FEC_MARKER_OFFSET: usize = 4;

/// Marker for a regular packet.
pub const FEC_MARKER_NONE: u8 = 0x00;

/// Marker for an erasure-coded symbol packet.
pub const FEC_MARKER_SYMBOL: u8 = 0xFF;

/// Length prefix of a stream frame.
pub const FRAME_PREFIX_LEN: usize = 4;

/// Largest packet a stream frame may declare (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Media payload prefix: 32-bit microsecond timestamp.
pub const MEDIA_TIMESTAMP_LEN: usize = 4;

// ─── Errors ──────────────────────────────────────────────────────────────────

/// A buffer that cannot be interpreted as a packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedPacket {
    #[error("packet too short: {len} bytes, header needs {needed}")]
    TooShort { len: usize, needed: usize },
    #[error("unknown FEC marker 0x{0:02x}")]
    UnknownMarker(u8),
    #[error("unknown frame type 0x{0:02x}")]
    UnknownFrameType(u8),
    #[error("frame length {0} exceeds limit")]
    FrameTooLarge(usize),
}

// ─── Video Tier ──────────────────────────────────────────────────────────────

/// Quality variant of a video (camera or screen) stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum VideoTier {
    Low = 0,
    Medium = 1,
    High = 2,
    Full = 3,
}

impl VideoTier {
    pub const ALL: [VideoTier; 4] = [
        VideoTier::Low,
        VideoTier::Medium,
        VideoTier::High,
        VideoTier::Full,
    ];

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(idx: u8) -> Option<Self> {
        match idx {
            0 => Some(VideoTier::Low),
            1 => Some(VideoTier::Medium),
            2 => Some(VideoTier::High),
            3 => Some(VideoTier::Full),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VideoTier::Low => "low",
            VideoTier::Medium => "medium",
            VideoTier::High => "high",
            VideoTier::Full => "full",
        }
    }
}

impl fmt::Display for VideoTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VideoTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(VideoTier::Low),
            "medium" => Ok(VideoTier::Medium),
            "high" => Ok(VideoTier::High),
            "full" => Ok(VideoTier::Full),
            other => Err(format!("unknown video tier: {other}")),
        }
    }
}

// ─── Frame Type ──────────────────────────────────────────────────────────────

/// What a packet payload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Camera key frame for a tier.
    VideoKey(VideoTier),
    /// Camera delta frame for a tier.
    VideoDelta(VideoTier),
    /// Screen-share key frame for a tier.
    ScreenKey(VideoTier),
    /// Screen-share delta frame for a tier.
    ScreenDelta(VideoTier),
    /// Microphone audio chunk.
    Audio,
    /// Screen-share audio chunk.
    ScreenAudio,
    /// JSON decoder configuration.
    Config,
    /// JSON control event.
    Event,
    /// Keepalive.
    Ping,
}

impl FrameType {
    /// Wire byte for this frame type.
    pub fn to_byte(self) -> u8 {
        match self {
            FrameType::VideoKey(t) => 2 * t.index(),
            FrameType::VideoDelta(t) => 0x01 + 2 * t.index(),
            FrameType::ScreenKey(t) => 0x10 + 2 * t.index(),
            FrameType::ScreenDelta(t) => 0x11 + 2 * t.index(),
            FrameType::Audio => 0x20,
            FrameType::ScreenAudio => 0x21,
            FrameType::Config => 0x30,
            FrameType::Event => 0x31,
            FrameType::Ping => 0x32,
        }
    }

    /// Parse a wire byte. Returns `None` for values outside the table.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00..=0x07 => {
                let tier = VideoTier::from_index(b / 2)?;
                Some(if b % 2 == 0 {
                    FrameType::VideoKey(tier)
                } else {
                    FrameType::VideoDelta(tier)
                })
            }
            0x10..=0x17 => {
                let tier = VideoTier::from_index((b - 0x10) / 2)?;
                Some(if b % 2 == 0 {
                    FrameType::ScreenKey(tier)
                } else {
                    FrameType::ScreenDelta(tier)
                })
            }
            0x20 => Some(FrameType::Audio),
            0x21 => Some(FrameType::ScreenAudio),
            0x30 => Some(FrameType::Config),
            0x31 => Some(FrameType::Event),
            0x32 => Some(FrameType::Ping),
            _ => None,
        }
    }

    /// Video frame type for a channel, or `None` if the channel carries no video.
    pub fn video(channel: ChannelName, key_frame: bool) -> Option<Self> {
        match (channel, key_frame) {
            (ChannelName::Camera(t), true) => Some(FrameType::VideoKey(t)),
            (ChannelName::Camera(t), false) => Some(FrameType::VideoDelta(t)),
            (ChannelName::Screen(t), true) => Some(FrameType::ScreenKey(t)),
            (ChannelName::Screen(t), false) => Some(FrameType::ScreenDelta(t)),
            _ => None,
        }
    }

    pub fn is_key(self) -> bool {
        matches!(self, FrameType::VideoKey(_) | FrameType::ScreenKey(_))
    }

    pub fn is_video(self) -> bool {
        matches!(
            self,
            FrameType::VideoKey(_)
                | FrameType::VideoDelta(_)
                | FrameType::ScreenKey(_)
                | FrameType::ScreenDelta(_)
        )
    }

    pub fn is_audio(self) -> bool {
        matches!(self, FrameType::Audio | FrameType::ScreenAudio)
    }

    /// Whether the payload starts with a [`MediaFrame`] timestamp.
    pub fn is_media(self) -> bool {
        self.is_video() || self.is_audio()
    }
}

// ─── Channel Name ────────────────────────────────────────────────────────────

/// Role of a channel within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    Control,
    VideoTier,
    Audio,
    ScreenVideo,
    ScreenAudio,
}

/// Protocol-fixed channel vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChannelName {
    Control,
    Microphone,
    ScreenAudio,
    Camera(VideoTier),
    Screen(VideoTier),
}

impl ChannelName {
    /// One-byte identifier used where channels share a single pipe.
    pub fn id(self) -> u8 {
        match self {
            ChannelName::Control => 0x00,
            ChannelName::Microphone => 0x01,
            ChannelName::ScreenAudio => 0x02,
            ChannelName::Camera(t) => 0x10 + t.index(),
            ChannelName::Screen(t) => 0x20 + t.index(),
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x00 => Some(ChannelName::Control),
            0x01 => Some(ChannelName::Microphone),
            0x02 => Some(ChannelName::ScreenAudio),
            0x10..=0x13 => VideoTier::from_index(id - 0x10).map(ChannelName::Camera),
            0x20..=0x23 => VideoTier::from_index(id - 0x20).map(ChannelName::Screen),
            _ => None,
        }
    }

    pub fn role(self) -> ChannelRole {
        match self {
            ChannelName::Control => ChannelRole::Control,
            ChannelName::Microphone => ChannelRole::Audio,
            ChannelName::ScreenAudio => ChannelRole::ScreenAudio,
            ChannelName::Camera(_) => ChannelRole::VideoTier,
            ChannelName::Screen(_) => ChannelRole::ScreenVideo,
        }
    }

    pub fn tier(self) -> Option<VideoTier> {
        match self {
            ChannelName::Camera(t) | ChannelName::Screen(t) => Some(t),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelName::Control => f.write_str("control"),
            ChannelName::Microphone => f.write_str("microphone"),
            ChannelName::ScreenAudio => f.write_str("screen-audio"),
            ChannelName::Camera(t) => write!(f, "camera-{t}"),
            ChannelName::Screen(t) => write!(f, "screen-{t}"),
        }
    }
}

impl std::str::FromStr for ChannelName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "control" => return Ok(ChannelName::Control),
            "microphone" => return Ok(ChannelName::Microphone),
            "screen-audio" => return Ok(ChannelName::ScreenAudio),
            _ => {}
        }
        if let Some(tier) = s.strip_prefix("camera-") {
            return tier.parse().map(ChannelName::Camera);
        }
        if let Some(tier) = s.strip_prefix("screen-") {
            return tier.parse().map(ChannelName::Screen);
        }
        Err(format!("unknown channel name: {s}"))
    }
}

/// Both names travel as their string form in JSON documents.
macro_rules! serde_as_str {
    ($ty:ty) => {
        impl serde::Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

serde_as_str!(VideoTier);
serde_as_str!(ChannelName);

// ─── FEC Config ──────────────────────────────────────────────────────────────

/// Parameters needed to invert the erasure code for one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FecConfig {
    /// Original payload length in bytes.
    pub transfer_length: u64,
    /// Bytes per symbol.
    pub symbol_size: u16,
    /// Source symbols in the block (K).
    pub source_blocks: u8,
    /// Repair symbols in the block (R).
    pub sub_blocks: u16,
    /// Symbol size alignment.
    pub alignment: u8,
}

impl FecConfig {
    pub const ENCODED_LEN: usize = 14;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.transfer_length);
        buf.put_u16(self.symbol_size);
        buf.put_u8(self.source_blocks);
        buf.put_u16(self.sub_blocks);
        buf.put_u8(self.alignment);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return None;
        }
        Some(FecConfig {
            transfer_length: buf.get_u64(),
            symbol_size: buf.get_u16(),
            source_blocks: buf.get_u8(),
            sub_blocks: buf.get_u16(),
            alignment: buf.get_u8(),
        })
    }

    /// The packed 14-byte form.
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        let mut cursor = &mut out[..];
        self.encode(&mut cursor);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let mut cursor = bytes;
        Self::decode(&mut cursor)
    }
}

// ─── Packet ──────────────────────────────────────────────────────────────────

/// A decoded packet: header fields plus payload (or one FEC symbol).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence: u32,
    pub frame_type: FrameType,
    /// Present for FEC symbol packets.
    pub fec: Option<FecConfig>,
    pub payload: Bytes,
}

impl Packet {
    pub fn is_fec(&self) -> bool {
        self.fec.is_some()
    }

    pub fn header_len(&self) -> usize {
        if self.fec.is_some() {
            FEC_HEADER_LEN
        } else {
            REGULAR_HEADER_LEN
        }
    }

    pub fn encode(&self) -> Bytes {
        match &self.fec {
            Some(cfg) => encode_fec(&self.payload, self.sequence, self.frame_type, cfg),
            None => encode_regular(&self.payload, self.sequence, self.frame_type),
        }
    }
}

/// `[seq][0x00][type][payload]`
pub fn encode_regular(payload: &[u8], sequence: u32, frame_type: FrameType) -> Bytes {
    let mut buf = BytesMut::with_capacity(REGULAR_HEADER_LEN + payload.len());
    buf.put_u32(sequence);
    buf.put_u8(FEC_MARKER_NONE);
    buf.put_u8(frame_type.to_byte());
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// `[seq][0xFF][type][config:14][symbol]`
pub fn encode_fec(symbol: &[u8], sequence: u32, frame_type: FrameType, config: &FecConfig) -> Bytes {
    let mut buf = BytesMut::with_capacity(FEC_HEADER_LEN + symbol.len());
    buf.put_u32(sequence);
    buf.put_u8(FEC_MARKER_SYMBOL);
    buf.put_u8(frame_type.to_byte());
    config.encode(&mut buf);
    buf.extend_from_slice(symbol);
    buf.freeze()
}

/// Decode a packet, dispatching on the marker byte at offset 4.
pub fn decode(bytes: Bytes) -> Result<Packet, MalformedPacket> {
    if bytes.len() < REGULAR_HEADER_LEN {
        return Err(MalformedPacket::TooShort {
            len: bytes.len(),
            needed: REGULAR_HEADER_LEN,
        });
    }

    let marker = bytes[FEC_MARKER_OFFSET];
    let header_len = match marker {
        FEC_MARKER_NONE => REGULAR_HEADER_LEN,
        FEC_MARKER_SYMBOL => FEC_HEADER_LEN,
        other => return Err(MalformedPacket::UnknownMarker(other)),
    };
    if bytes.len() < header_len {
        return Err(MalformedPacket::TooShort {
            len: bytes.len(),
            needed: header_len,
        });
    }

    let mut header = &bytes[..header_len];
    let sequence = header.get_u32();
    let _marker = header.get_u8();
    let type_byte = header.get_u8();
    let frame_type =
        FrameType::from_byte(type_byte).ok_or(MalformedPacket::UnknownFrameType(type_byte))?;
    let fec = if marker == FEC_MARKER_SYMBOL {
        // Length was checked above, so the config is always present.
        FecConfig::decode(&mut header)
    } else {
        None
    };

    Ok(Packet {
        sequence,
        frame_type,
        fec,
        payload: bytes.slice(header_len..),
    })
}

// ─── Media Frame Body ────────────────────────────────────────────────────────

/// Body of an audio/video payload: relative timestamp plus encoded bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    /// Microseconds since the stream epoch, saturated to u32.
    pub timestamp_us: u32,
    pub data: Bytes,
}

impl MediaFrame {
    pub fn new(timestamp_us: u64, data: Bytes) -> Self {
        MediaFrame {
            timestamp_us: saturate_timestamp(timestamp_us),
            data,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MEDIA_TIMESTAMP_LEN + self.data.len());
        buf.put_u32(self.timestamp_us);
        buf.extend_from_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(payload: Bytes) -> Result<Self, MalformedPacket> {
        if payload.len() < MEDIA_TIMESTAMP_LEN {
            return Err(MalformedPacket::TooShort {
                len: payload.len(),
                needed: MEDIA_TIMESTAMP_LEN,
            });
        }
        let timestamp_us = (&payload[..MEDIA_TIMESTAMP_LEN]).get_u32();
        Ok(MediaFrame {
            timestamp_us,
            data: payload.slice(MEDIA_TIMESTAMP_LEN..),
        })
    }
}

/// Clamp a microsecond timestamp into the u32 wire range.
pub fn saturate_timestamp(timestamp_us: u64) -> u32 {
    timestamp_us.min(u32::MAX as u64) as u32
}

// ─── Stream Framing ──────────────────────────────────────────────────────────

/// Wrap a packet for a byte-stream transport: `[len:u32][packet]`.
pub fn encode_frame(packet: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_PREFIX_LEN + packet.len());
    buf.put_u32(packet.len() as u32);
    buf.extend_from_slice(packet);
    buf.freeze()
}

/// Reassembles length-delimited frames from arbitrarily split stream reads.
#[derive(Debug, Default)]
pub struct FrameReassembler {
    buf: BytesMut,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// A declared length above [`MAX_FRAME_LEN`] is unrecoverable for the
    /// stream and is reported as an error.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, MalformedPacket> {
        if self.buf.len() < FRAME_PREFIX_LEN {
            return Ok(None);
        }
        let len = (&self.buf[..FRAME_PREFIX_LEN]).get_u32() as usize;
        if len > MAX_FRAME_LEN {
            return Err(MalformedPacket::FrameTooLarge(len));
        }
        if self.buf.len() < FRAME_PREFIX_LEN + len {
            return Ok(None);
        }
        self.buf.advance(FRAME_PREFIX_LEN);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Bytes held but not yet returned.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_header_layout() {
        let bytes = encode_regular(b"abc", 0x0102_0304, FrameType::VideoKey(VideoTier::High));
        assert_eq!(bytes.len(), REGULAR_HEADER_LEN + 3);
        assert_eq!(&bytes[..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(bytes[4], FEC_MARKER_NONE);
        assert_eq!(bytes[5], 0x04);
        assert_eq!(&bytes[6..], b"abc");
    }

    #[test]
    fn fec_header_layout() {
        let cfg = FecConfig {
            transfer_length: 0x0A0B,
            symbol_size: 1024,
            source_blocks: 3,
            sub_blocks: 2,
            alignment: 64,
        };
        let bytes = encode_fec(b"sym", 7, FrameType::Config, &cfg);
        assert_eq!(bytes.len(), FEC_HEADER_LEN + 3);
        assert_eq!(bytes[4], FEC_MARKER_SYMBOL);
        assert_eq!(bytes[5], 0x30);
        assert_eq!(&bytes[6..14], &0x0A0Bu64.to_be_bytes());
        assert_eq!(&bytes[14..16], &1024u16.to_be_bytes());
        assert_eq!(bytes[16], 3);
        assert_eq!(&bytes[17..19], &2u16.to_be_bytes());
        assert_eq!(bytes[19], 64);
    }

    #[test]
    fn decode_regular_roundtrip() {
        let bytes = encode_regular(b"payload", 42, FrameType::Audio);
        let pkt = decode(bytes).unwrap();
        assert_eq!(pkt.sequence, 42);
        assert_eq!(pkt.frame_type, FrameType::Audio);
        assert!(pkt.fec.is_none());
        assert_eq!(&pkt.payload[..], b"payload");
    }

    #[test]
    fn decode_rejects_short_buffers() {
        assert_eq!(
            decode(Bytes::from_static(&[0, 0, 0])),
            Err(MalformedPacket::TooShort { len: 3, needed: 6 })
        );
        // FEC marker with only a regular header's worth of bytes
        let short_fec = Bytes::from_static(&[0, 0, 0, 1, 0xFF, 0x30, 0, 0]);
        assert!(matches!(
            decode(short_fec),
            Err(MalformedPacket::TooShort { needed: 20, .. })
        ));
    }

    #[test]
    fn decode_rejects_unknown_marker_and_type() {
        assert_eq!(
            decode(Bytes::from_static(&[0, 0, 0, 1, 0x7F, 0x30])),
            Err(MalformedPacket::UnknownMarker(0x7F))
        );
        assert_eq!(
            decode(Bytes::from_static(&[0, 0, 0, 1, 0x00, 0xEE])),
            Err(MalformedPacket::UnknownFrameType(0xEE))
        );
    }

    #[test]
    fn empty_payload_is_valid() {
        let pkt = decode(encode_regular(b"", u32::MAX, FrameType::Ping)).unwrap();
        assert_eq!(pkt.sequence, u32::MAX);
        assert!(pkt.payload.is_empty());
    }

    #[test]
    fn frame_type_table_is_bijective() {
        for b in 0u8..=255 {
            if let Some(ft) = FrameType::from_byte(b) {
                assert_eq!(ft.to_byte(), b, "byte 0x{b:02x}");
            }
        }
        for tier in VideoTier::ALL {
            for ft in [
                FrameType::VideoKey(tier),
                FrameType::VideoDelta(tier),
                FrameType::ScreenKey(tier),
                FrameType::ScreenDelta(tier),
            ] {
                assert_eq!(FrameType::from_byte(ft.to_byte()), Some(ft));
            }
        }
    }

    #[test]
    fn channel_names_parse_and_display() {
        let names = [
            ChannelName::Control,
            ChannelName::Microphone,
            ChannelName::ScreenAudio,
            ChannelName::Camera(VideoTier::Low),
            ChannelName::Screen(VideoTier::Full),
        ];
        for name in names {
            assert_eq!(name.to_string().parse::<ChannelName>(), Ok(name));
            assert_eq!(ChannelName::from_id(name.id()), Some(name));
        }
        assert_eq!(ChannelName::Camera(VideoTier::High).to_string(), "camera-high");
        assert!("camera-ultra".parse::<ChannelName>().is_err());
        assert!("speaker".parse::<ChannelName>().is_err());
    }

    #[test]
    fn media_frame_saturates_timestamp() {
        let frame = MediaFrame::new(u64::MAX, Bytes::from_static(b"x"));
        assert_eq!(frame.timestamp_us, u32::MAX);
        let decoded = MediaFrame::decode(frame.encode()).unwrap();
        assert_eq!(decoded, frame);
        assert!(MediaFrame::decode(Bytes::from_static(b"abc")).is_err());
    }

    #[test]
    fn reassembler_handles_split_reads() {
        let a = encode_frame(b"first");
        let b = encode_frame(b"second packet");
        let mut stream = Vec::new();
        stream.extend_from_slice(&a);
        stream.extend_from_slice(&b);

        let mut r = FrameReassembler::new();
        let mut out = Vec::new();
        for chunk in stream.chunks(3) {
            r.push(chunk);
            while let Some(frame) = r.next_frame().unwrap() {
                out.push(frame);
            }
        }
        assert_eq!(out, vec![Bytes::from_static(b"first"), Bytes::from_static(b"second packet")]);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn reassembler_rejects_oversized_length() {
        let mut r = FrameReassembler::new();
        r.push(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes());
        assert!(matches!(r.next_frame(), Err(MalformedPacket::FrameTooLarge(_))));
    }
}
