//! # Media Collaborators
//!
//! Capture devices, encoders and decoders are external components. The
//! engine only sees these traits: capture yields raw frames and sample
//! buffers, encoders turn them into opaque encoded units, decoders turn
//! encoded units back into presentable frames.
//!
//! [`synthetic`] implements every trait with deterministic in-process
//! sources, used by the loopback binary and the tests.

use bytes::Bytes;
use std::sync::Arc;

use crate::error::MediaError;
use crate::transport::BoxFuture;
use meetlink_common::protocol::{AudioDecoderConfig, VideoDecoderConfig};

/// A raw captured video frame.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    /// Capture timestamp on the device clock.
    pub timestamp_us: u64,
    pub data: Bytes,
}

/// Interleaved PCM samples.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioBuffer {
    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoSettings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
}

pub trait VideoTrack: Send + Sync {
    fn settings(&self) -> VideoSettings;
    /// Most recent frame, if the device has produced one.
    fn latest_frame(&self) -> Option<VideoFrame>;
    fn stop(&self);
}

pub trait AudioTrack: Send + Sync {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
    /// Next captured buffer; `None` once the track ended.
    fn read(&self) -> BoxFuture<'_, Option<AudioBuffer>>;
    fn stop(&self);
}

/// Tracks handed out by a capture device.
#[derive(Clone, Default)]
pub struct MediaStream {
    pub video: Option<Arc<dyn VideoTrack>>,
    pub audio: Option<Arc<dyn AudioTrack>>,
}

impl MediaStream {
    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }

    pub fn stop(&self) {
        if let Some(video) = &self.video {
            video.stop();
        }
        if let Some(audio) = &self.audio {
            audio.stop();
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub video: bool,
    pub audio: bool,
    pub camera_id: Option<String>,
    pub microphone_id: Option<String>,
}

pub trait CaptureDevice: Send + Sync {
    /// Acquire tracks for `constraints`. Fails if any requested track is
    /// unavailable.
    fn acquire(&self, constraints: &CaptureConstraints) -> BoxFuture<'_, Result<MediaStream, MediaError>>;
}

// ─── Encoders ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct VideoEncoderSettings {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub bitrate: u32,
}

#[derive(Debug, Clone)]
pub struct EncodedVideo {
    pub data: Bytes,
    pub key_frame: bool,
    pub timestamp_us: u64,
}

pub trait VideoEncoder: Send {
    fn encode(&mut self, frame: &VideoFrame, key_frame: bool) -> Result<Vec<EncodedVideo>, MediaError>;
    /// Decoder bootstrap info; available once the encoder produced output.
    fn decoder_config(&self) -> Option<VideoDecoderConfig>;
    fn flush(&mut self) -> Result<Vec<EncodedVideo>, MediaError>;
}

pub trait VideoEncoderFactory: Send + Sync {
    fn create(&self, settings: &VideoEncoderSettings) -> Result<Box<dyn VideoEncoder>, MediaError>;
}

/// One encoded audio chunk (an Ogg page of Opus packets).
#[derive(Debug, Clone)]
pub struct EncodedAudio {
    pub data: Bytes,
    /// Samples per channel covered by the chunk.
    pub samples: u32,
}

pub trait AudioEncoder: Send {
    fn encode(&mut self, buffer: &AudioBuffer) -> Result<Vec<EncodedAudio>, MediaError>;
    fn flush(&mut self) -> Result<Vec<EncodedAudio>, MediaError>;
}

pub trait AudioEncoderFactory: Send + Sync {
    fn create(&self, sample_rate: u32, channels: u16, bitrate: u32) -> Result<Box<dyn AudioEncoder>, MediaError>;
}

// ─── Decoders ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedVideo {
    pub width: u32,
    pub height: u32,
    /// Media timestamp on the publisher's timeline.
    pub timestamp_us: u32,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub timestamp_us: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

pub trait VideoDecoder: Send {
    fn configure(&mut self, config: &VideoDecoderConfig) -> Result<(), MediaError>;
    fn decode(&mut self, data: &[u8], timestamp_us: u32, key_frame: bool) -> Result<Vec<DecodedVideo>, MediaError>;
}

pub trait AudioDecoder: Send {
    fn configure(&mut self, config: &AudioDecoderConfig) -> Result<(), MediaError>;
    fn decode(&mut self, data: &[u8], timestamp_us: u32) -> Result<Vec<DecodedAudio>, MediaError>;
}

pub trait DecoderFactory: Send + Sync {
    fn video(&self) -> Box<dyn VideoDecoder>;
    fn audio(&self) -> Box<dyn AudioDecoder>;
}

/// Magic that starts every valid audio chunk.
pub const OGG_MAGIC: &[u8; 4] = b"OggS";

pub fn is_valid_audio_chunk(data: &[u8]) -> bool {
    data.starts_with(OGG_MAGIC)
}

// ─── Synthetic ──────────────────────────────────────────────────────────────

pub mod synthetic {
    //! Deterministic stand-ins for devices and codecs.
    //!
    //! Encoded video is `[K|D][frame index:u32][filler]`; encoded audio is
    //! `OggS[samples:u32][filler]`, preceded by one `OggSOpusHead` header
    //! chunk.

    use super::*;
    use bytes::{BufMut, BytesMut};
    use quanta::Instant;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    pub struct SyntheticCamera {
        settings: VideoSettings,
        started: Instant,
        frames: AtomicU64,
        stopped: AtomicBool,
        label: String,
    }

    impl SyntheticCamera {
        pub fn new(label: impl Into<String>, settings: VideoSettings) -> Self {
            SyntheticCamera {
                settings,
                started: Instant::now(),
                frames: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
                label: label.into(),
            }
        }

        pub fn label(&self) -> &str {
            &self.label
        }

        pub fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::Acquire)
        }
    }

    impl VideoTrack for SyntheticCamera {
        fn settings(&self) -> VideoSettings {
            self.settings
        }

        fn latest_frame(&self) -> Option<VideoFrame> {
            if self.is_stopped() {
                return None;
            }
            let index = self.frames.fetch_add(1, Ordering::AcqRel);
            Some(VideoFrame {
                width: self.settings.width,
                height: self.settings.height,
                timestamp_us: self.started.elapsed().as_micros() as u64,
                data: Bytes::copy_from_slice(&index.to_be_bytes()),
            })
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::Release);
        }
    }

    /// A 440 Hz tone delivered in real-time paced buffers.
    pub struct SyntheticMicrophone {
        sample_rate: u32,
        channels: u16,
        buffer_frames: usize,
        pacing: AsyncMutex<tokio::time::Interval>,
        position: AtomicU64,
        stopped: AtomicBool,
    }

    impl SyntheticMicrophone {
        pub fn new(sample_rate: u32, channels: u16, buffer: Duration) -> Self {
            let buffer_frames = (sample_rate as u128 * buffer.as_micros() / 1_000_000).max(1) as usize;
            let mut pacing = tokio::time::interval(buffer);
            pacing.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            SyntheticMicrophone {
                sample_rate,
                channels: channels.max(1),
                buffer_frames,
                pacing: AsyncMutex::new(pacing),
                position: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
            }
        }
    }

    impl AudioTrack for SyntheticMicrophone {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn channels(&self) -> u16 {
            self.channels
        }

        fn read(&self) -> BoxFuture<'_, Option<AudioBuffer>> {
            Box::pin(async move {
                if self.stopped.load(Ordering::Acquire) {
                    return None;
                }
                self.pacing.lock().await.tick().await;
                if self.stopped.load(Ordering::Acquire) {
                    return None;
                }
                let start = self.position.fetch_add(self.buffer_frames as u64, Ordering::AcqRel);
                let step = 2.0 * std::f32::consts::PI * 440.0 / self.sample_rate as f32;
                let mut samples = Vec::with_capacity(self.buffer_frames * self.channels as usize);
                for i in 0..self.buffer_frames {
                    let v = 0.2 * ((start + i as u64) as f32 * step).sin();
                    samples.extend(std::iter::repeat(v).take(self.channels as usize));
                }
                Some(AudioBuffer {
                    sample_rate: self.sample_rate,
                    channels: self.channels,
                    samples,
                })
            })
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::Release);
        }
    }

    /// Capture device that can be told to refuse video or audio.
    pub struct SyntheticCapture {
        pub video: VideoSettings,
        pub sample_rate: u32,
        pub channels: u16,
        pub video_fails: bool,
        pub audio_fails: bool,
    }

    impl Default for SyntheticCapture {
        fn default() -> Self {
            SyntheticCapture {
                video: VideoSettings {
                    width: 1280,
                    height: 720,
                    frame_rate: 30.0,
                },
                sample_rate: 48_000,
                channels: 1,
                video_fails: false,
                audio_fails: false,
            }
        }
    }

    impl CaptureDevice for SyntheticCapture {
        fn acquire(&self, constraints: &CaptureConstraints) -> BoxFuture<'_, Result<MediaStream, MediaError>> {
            let constraints = constraints.clone();
            Box::pin(async move {
                if constraints.video && self.video_fails {
                    return Err(MediaError::Capture("camera unavailable".into()));
                }
                if constraints.audio && self.audio_fails {
                    return Err(MediaError::Capture("microphone unavailable".into()));
                }
                let mut stream = MediaStream::default();
                if constraints.video {
                    let label = constraints.camera_id.unwrap_or_else(|| "synthetic-camera".into());
                    stream.video = Some(Arc::new(SyntheticCamera::new(label, self.video)));
                }
                if constraints.audio {
                    stream.audio = Some(Arc::new(SyntheticMicrophone::new(
                        self.sample_rate,
                        self.channels,
                        Duration::from_millis(20),
                    )));
                }
                Ok(stream)
            })
        }
    }

    pub struct SyntheticVideoEncoder {
        settings: VideoEncoderSettings,
        key_frame_len: usize,
        delta_frame_len: usize,
        produced: bool,
    }

    impl VideoEncoder for SyntheticVideoEncoder {
        fn encode(&mut self, frame: &VideoFrame, key_frame: bool) -> Result<Vec<EncodedVideo>, MediaError> {
            let len = if key_frame { self.key_frame_len } else { self.delta_frame_len };
            let mut buf = BytesMut::with_capacity(len.max(5));
            buf.put_u8(if key_frame { b'K' } else { b'D' });
            let index = frame
                .data
                .get(..8)
                .and_then(|b| <[u8; 8]>::try_from(b).ok())
                .map_or(0, u64::from_be_bytes);
            buf.put_u32(index as u32);
            buf.resize(len.max(5), 0xA5);
            self.produced = true;
            Ok(vec![EncodedVideo {
                data: buf.freeze(),
                key_frame,
                timestamp_us: frame.timestamp_us,
            }])
        }

        fn decoder_config(&self) -> Option<VideoDecoderConfig> {
            self.produced.then(|| VideoDecoderConfig {
                codec: self.settings.codec.clone(),
                coded_width: self.settings.width,
                coded_height: self.settings.height,
                frame_rate: self.settings.frame_rate,
                description: Some(b"synthetic-v1".to_vec()),
            })
        }

        fn flush(&mut self) -> Result<Vec<EncodedVideo>, MediaError> {
            Ok(Vec::new())
        }
    }

    /// Key frames above the default FEC threshold, small delta frames.
    pub struct SyntheticVideoEncoderFactory {
        pub key_frame_len: usize,
        pub delta_frame_len: usize,
    }

    impl Default for SyntheticVideoEncoderFactory {
        fn default() -> Self {
            SyntheticVideoEncoderFactory {
                key_frame_len: 4096,
                delta_frame_len: 600,
            }
        }
    }

    impl VideoEncoderFactory for SyntheticVideoEncoderFactory {
        fn create(&self, settings: &VideoEncoderSettings) -> Result<Box<dyn VideoEncoder>, MediaError> {
            if settings.width == 0 || settings.height == 0 {
                return Err(MediaError::Unsupported(format!(
                    "{}x{}",
                    settings.width, settings.height
                )));
            }
            Ok(Box::new(SyntheticVideoEncoder {
                settings: settings.clone(),
                key_frame_len: self.key_frame_len,
                delta_frame_len: self.delta_frame_len,
                produced: false,
            }))
        }
    }

    pub struct SyntheticAudioEncoder {
        header_sent: bool,
    }

    impl AudioEncoder for SyntheticAudioEncoder {
        fn encode(&mut self, buffer: &AudioBuffer) -> Result<Vec<EncodedAudio>, MediaError> {
            let mut out = Vec::with_capacity(2);
            if !self.header_sent {
                self.header_sent = true;
                out.push(EncodedAudio {
                    data: Bytes::from_static(b"OggSOpusHead"),
                    samples: 0,
                });
            }
            let frames = buffer.frames() as u32;
            let mut buf = BytesMut::with_capacity(64);
            buf.put_slice(OGG_MAGIC);
            buf.put_u32(frames);
            buf.resize(64, 0x5A);
            out.push(EncodedAudio {
                data: buf.freeze(),
                samples: frames,
            });
            Ok(out)
        }

        fn flush(&mut self) -> Result<Vec<EncodedAudio>, MediaError> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    pub struct SyntheticAudioEncoderFactory;

    impl AudioEncoderFactory for SyntheticAudioEncoderFactory {
        fn create(&self, _sample_rate: u32, _channels: u16, _bitrate: u32) -> Result<Box<dyn AudioEncoder>, MediaError> {
            Ok(Box::new(SyntheticAudioEncoder { header_sent: false }))
        }
    }

    #[derive(Default)]
    pub struct SyntheticVideoDecoder {
        config: Option<VideoDecoderConfig>,
    }

    impl VideoDecoder for SyntheticVideoDecoder {
        fn configure(&mut self, config: &VideoDecoderConfig) -> Result<(), MediaError> {
            self.config = Some(config.clone());
            Ok(())
        }

        fn decode(&mut self, data: &[u8], timestamp_us: u32, _key_frame: bool) -> Result<Vec<DecodedVideo>, MediaError> {
            let config = self
                .config
                .as_ref()
                .ok_or_else(|| MediaError::Decode("decoder not configured".into()))?;
            if !matches!(data.first(), Some(b'K' | b'D')) {
                return Err(MediaError::Decode("not a synthetic video frame".into()));
            }
            Ok(vec![DecodedVideo {
                width: config.coded_width,
                height: config.coded_height,
                timestamp_us,
                data: Bytes::copy_from_slice(data),
            }])
        }
    }

    #[derive(Default)]
    pub struct SyntheticAudioDecoder {
        config: Option<AudioDecoderConfig>,
    }

    impl AudioDecoder for SyntheticAudioDecoder {
        fn configure(&mut self, config: &AudioDecoderConfig) -> Result<(), MediaError> {
            self.config = Some(config.clone());
            Ok(())
        }

        fn decode(&mut self, data: &[u8], timestamp_us: u32) -> Result<Vec<DecodedAudio>, MediaError> {
            let config = self
                .config
                .as_ref()
                .ok_or_else(|| MediaError::Decode("decoder not configured".into()))?;
            if !is_valid_audio_chunk(data) {
                return Err(MediaError::Decode("missing Ogg magic".into()));
            }
            let frames = data
                .get(OGG_MAGIC.len()..OGG_MAGIC.len() + 4)
                .and_then(|b| <[u8; 4]>::try_from(b).ok())
                .map_or(0, u32::from_be_bytes) as usize;
            let channels = config.channel_count.max(1);
            Ok(vec![DecodedAudio {
                timestamp_us,
                sample_rate: config.sample_rate,
                channels,
                samples: vec![0.25; frames * channels as usize],
            }])
        }
    }

    #[derive(Default)]
    pub struct SyntheticDecoderFactory;

    impl DecoderFactory for SyntheticDecoderFactory {
        fn video(&self) -> Box<dyn VideoDecoder> {
            Box::<SyntheticVideoDecoder>::default()
        }

        fn audio(&self) -> Box<dyn AudioDecoder> {
            Box::<SyntheticAudioDecoder>::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::synthetic::*;
    use super::*;

    #[test]
    fn ogg_magic_check() {
        assert!(is_valid_audio_chunk(b"OggS\0\0"));
        assert!(!is_valid_audio_chunk(b"Ogg"));
        assert!(!is_valid_audio_chunk(b"RIFF...."));
    }

    #[test]
    fn synthetic_encoder_exposes_config_after_first_frame() {
        let factory = SyntheticVideoEncoderFactory::default();
        let settings = VideoEncoderSettings {
            codec: "vp8".into(),
            width: 640,
            height: 360,
            frame_rate: 30.0,
            bitrate: 500_000,
        };
        let mut encoder = factory.create(&settings).unwrap();
        assert!(encoder.decoder_config().is_none());

        let frame = VideoFrame {
            width: 640,
            height: 360,
            timestamp_us: 0,
            data: Bytes::copy_from_slice(&7u64.to_be_bytes()),
        };
        let out = encoder.encode(&frame, true).unwrap();
        assert_eq!(out[0].data.len(), 4096);
        assert_eq!(&out[0].data[..5], &[b'K', 0, 0, 0, 7]);
        assert_eq!(encoder.decoder_config().unwrap().coded_width, 640);
    }

    #[test]
    fn synthetic_audio_round_trip() {
        let mut encoder = SyntheticAudioEncoderFactory.create(48_000, 1, 32_000).unwrap();
        let buffer = AudioBuffer {
            sample_rate: 48_000,
            channels: 1,
            samples: vec![0.0; 960],
        };
        let chunks = encoder.encode(&buffer).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(&chunks[0].data[..], b"OggSOpusHead");
        assert_eq!(chunks[1].samples, 960);

        let mut decoder = SyntheticDecoderFactory.audio();
        assert!(decoder.decode(&chunks[1].data, 0).is_err());
        decoder
            .configure(&AudioDecoderConfig {
                codec: "opus".into(),
                sample_rate: 48_000,
                channel_count: 1,
                description: None,
            })
            .unwrap();
        let decoded = decoder.decode(&chunks[1].data, 20_000).unwrap();
        assert_eq!(decoded[0].samples.len(), 960);
        assert_eq!(decoded[0].timestamp_us, 20_000);
    }

    #[tokio::test]
    async fn capture_can_refuse_video() {
        let capture = SyntheticCapture {
            video_fails: true,
            ..SyntheticCapture::default()
        };
        let both = CaptureConstraints {
            video: true,
            audio: true,
            ..Default::default()
        };
        assert!(capture.acquire(&both).await.is_err());
        let audio_only = CaptureConstraints {
            audio: true,
            ..Default::default()
        };
        let stream = capture.acquire(&audio_only).await.unwrap();
        assert!(stream.video.is_none() && stream.audio.is_some());
    }
}
