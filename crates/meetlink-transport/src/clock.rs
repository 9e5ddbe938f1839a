//! # Media Clock
//!
//! Per-publisher media timeline. Video timestamps are capture timestamps
//! relative to the first captured video frame; audio timestamps are derived
//! from the sample count since the first audio chunk, anchored on the same
//! wall-clock epoch so both tracks share one timeline.

use quanta::Instant;

use crate::wire::saturate_timestamp;

/// Media timeline owned by a single publisher.
#[derive(Debug, Default)]
pub struct MediaClock {
    /// Wall-clock instant of the timeline's zero.
    epoch: Option<Instant>,
    /// Media time minus capture time (µs) for the current video device.
    video_offset_us: Option<i128>,
    /// Re-anchor the video device clock on the next frame.
    rebase_pending: bool,
    /// Media time of the first audio chunk.
    audio_anchor_us: Option<u64>,
}

impl MediaClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp a video frame captured at `capture_us`.
    pub fn video_timestamp(&mut self, capture_us: u64) -> u32 {
        self.video_timestamp_at(capture_us, Instant::now())
    }

    pub fn video_timestamp_at(&mut self, capture_us: u64, now: Instant) -> u32 {
        let epoch = *self.epoch.get_or_insert(now);
        let offset = match self.video_offset_us {
            Some(offset) if !self.rebase_pending => offset,
            _ => {
                let media_now = now.saturating_duration_since(epoch).as_micros() as i128;
                let offset = media_now - capture_us as i128;
                self.video_offset_us = Some(offset);
                self.rebase_pending = false;
                offset
            }
        };
        let media = (capture_us as i128 + offset).clamp(0, u64::MAX as i128) as u64;
        saturate_timestamp(media)
    }

    /// The video device changed: its next frame is mapped to the current
    /// wall-clock position on the timeline.
    pub fn rebase_video(&mut self) {
        self.rebase_pending = true;
    }

    /// Stamp an audio chunk that starts `sample_count` samples after the
    /// first chunk.
    pub fn audio_timestamp(&mut self, sample_count: u64, sample_rate: u32) -> u32 {
        self.audio_timestamp_at(sample_count, sample_rate, Instant::now())
    }

    pub fn audio_timestamp_at(&mut self, sample_count: u64, sample_rate: u32, now: Instant) -> u32 {
        let anchor = match self.audio_anchor_us {
            Some(anchor) => anchor,
            None => {
                let epoch = *self.epoch.get_or_insert(now);
                let anchor = now.saturating_duration_since(epoch).as_micros() as u64;
                self.audio_anchor_us = Some(anchor);
                anchor
            }
        };
        let offset = if sample_rate == 0 {
            0
        } else {
            sample_count.saturating_mul(1_000_000) / sample_rate as u64
        };
        saturate_timestamp(anchor.saturating_add(offset))
    }

    /// True once any track has fixed the epoch.
    pub fn is_started(&self) -> bool {
        self.epoch.is_some()
    }

    /// Forget the timeline (new capture session).
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn video_relative_to_first_capture() {
        let mut clock = MediaClock::new();
        let now = Instant::now();
        assert_eq!(clock.video_timestamp_at(5_000_000, now), 0);
        assert_eq!(clock.video_timestamp_at(5_033_333, now), 33_333);
        // Out-of-order capture timestamps clamp at zero.
        assert_eq!(clock.video_timestamp_at(4_000_000, now), 0);
    }

    #[test]
    fn audio_without_video_starts_at_zero() {
        let mut clock = MediaClock::new();
        let now = Instant::now();
        assert_eq!(clock.audio_timestamp_at(0, 48_000, now), 0);
        assert_eq!(clock.audio_timestamp_at(960, 48_000, now), 20_000);
        assert_eq!(clock.audio_timestamp_at(48_000, 48_000, now), 1_000_000);
    }

    #[test]
    fn audio_anchored_on_video_epoch() {
        let mut clock = MediaClock::new();
        let t0 = Instant::now();
        clock.video_timestamp_at(1_000, t0);
        let t1 = t0 + Duration::from_millis(250);
        assert_eq!(clock.audio_timestamp_at(0, 48_000, t1), 250_000);
        // Anchor is fixed by the first chunk.
        let t2 = t0 + Duration::from_secs(5);
        assert_eq!(clock.audio_timestamp_at(480, 48_000, t2), 260_000);
    }

    #[test]
    fn rebase_continues_the_timeline() {
        let mut clock = MediaClock::new();
        let t0 = Instant::now();
        clock.video_timestamp_at(9_000_000, t0);
        clock.rebase_video();
        // New device clock starts near zero, one second into the session.
        let t1 = t0 + Duration::from_secs(1);
        assert_eq!(clock.video_timestamp_at(100, t1), 1_000_000);
        assert_eq!(clock.video_timestamp_at(33_433, t1), 1_033_333);
    }

    #[test]
    fn timestamps_saturate() {
        let mut clock = MediaClock::new();
        let now = Instant::now();
        clock.video_timestamp_at(0, now);
        assert_eq!(clock.video_timestamp_at(u64::MAX, now), u32::MAX);
    }
}
