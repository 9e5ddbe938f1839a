//! # Receive-Side Buffers
//!
//! - [`ConfigGate`] holds media that arrives before the channel's decoder
//!   config and releases it once the config has been applied (exactly once).
//! - [`PlayoutBuffer`] realigns decoded video against the audio playback
//!   clock, or paces it by a fixed jitter delay when there is no audio.

use quanta::Instant;
use std::collections::VecDeque;
use std::time::Duration;

// ─── Config Gate ────────────────────────────────────────────────────────────

/// Result of offering media to a [`ConfigGate`].
#[derive(Debug, PartialEq, Eq)]
pub enum GateOutcome<T> {
    /// Config already applied; decode now.
    Pass(T),
    /// Buffered until the config arrives.
    Held,
}

/// Bounded pre-config buffer for one channel.
#[derive(Debug)]
pub struct ConfigGate<T> {
    applied: bool,
    pending: VecDeque<T>,
    capacity: usize,
    /// Items evicted because the buffer was full.
    pub overflowed: u64,
    /// Configs received after the first one.
    pub duplicate_configs: u64,
}

impl<T> ConfigGate<T> {
    pub fn new(capacity: usize) -> Self {
        ConfigGate {
            applied: false,
            pending: VecDeque::new(),
            capacity: capacity.max(1),
            overflowed: 0,
            duplicate_configs: 0,
        }
    }

    /// Offer a media item. Before the config, the oldest item is evicted
    /// when the buffer is full.
    pub fn offer(&mut self, item: T) -> GateOutcome<T> {
        if self.applied {
            return GateOutcome::Pass(item);
        }
        if self.pending.len() >= self.capacity {
            self.pending.pop_front();
            self.overflowed += 1;
        }
        self.pending.push_back(item);
        GateOutcome::Held
    }

    /// Mark the config applied. Returns the buffered items in arrival order
    /// the first time, `None` for duplicates.
    pub fn apply_config(&mut self) -> Option<Vec<T>> {
        if self.applied {
            self.duplicate_configs += 1;
            return None;
        }
        self.applied = true;
        Some(self.pending.drain(..).collect())
    }

    pub fn is_applied(&self) -> bool {
        self.applied
    }

    pub fn held(&self) -> usize {
        self.pending.len()
    }
}

// ─── Playout Buffer ─────────────────────────────────────────────────────────

/// Configuration for the video playout buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayoutConfig {
    /// Hold time measured from the first frame when no audio clock exists.
    pub jitter_delay: Duration,
    /// Frames this far behind the audio clock are dropped.
    pub late_threshold: Duration,
    /// Upper bound on buffered frames; the oldest is dropped beyond it.
    pub max_frames: usize,
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        Self {
            jitter_delay: Duration::from_millis(60),
            late_threshold: Duration::from_millis(100),
            max_frames: 30,
        }
    }
}

struct Entry<T> {
    timestamp_us: u32,
    item: T,
}

/// Orders decoded frames by media timestamp and releases them on time.
///
/// With an audio clock, frames at or before the clock are released and frames
/// more than `late_threshold` behind it are dropped; frames ahead of the clock
/// wait. Without one, each frame is released at
/// `first_arrival + jitter_delay + (timestamp - first_timestamp)`.
pub struct PlayoutBuffer<T> {
    config: PlayoutConfig,
    frames: VecDeque<Entry<T>>,
    anchor: Option<(Instant, u32)>,
    pub frames_released: u64,
    pub frames_late: u64,
    pub frames_overflowed: u64,
}

impl<T> PlayoutBuffer<T> {
    pub fn new(config: PlayoutConfig) -> Self {
        PlayoutBuffer {
            config,
            frames: VecDeque::new(),
            anchor: None,
            frames_released: 0,
            frames_late: 0,
            frames_overflowed: 0,
        }
    }

    pub fn push(&mut self, timestamp_us: u32, item: T, now: Instant) {
        if self.anchor.is_none() {
            self.anchor = Some((now, timestamp_us));
        }

        // Decoders emit in order almost always; scan from the back.
        let pos = self
            .frames
            .iter()
            .rposition(|e| e.timestamp_us <= timestamp_us)
            .map_or(0, |p| p + 1);
        self.frames.insert(pos, Entry { timestamp_us, item });

        while self.frames.len() > self.config.max_frames {
            self.frames.pop_front();
            self.frames_overflowed += 1;
        }
    }

    /// Release frames due at `now`, given the audio playback position
    /// (µs, same timeline as the frame timestamps) if audio is playing.
    pub fn release(&mut self, now: Instant, audio_clock_us: Option<u64>) -> Vec<(u32, T)> {
        let mut out = Vec::new();
        match audio_clock_us {
            Some(clock) => {
                let late = self.config.late_threshold.as_micros() as u64;
                while let Some(front) = self.frames.front() {
                    let ts = front.timestamp_us as u64;
                    if ts > clock {
                        break;
                    }
                    let Some(entry) = self.frames.pop_front() else {
                        break;
                    };
                    if ts + late < clock {
                        self.frames_late += 1;
                        tracing::debug!(timestamp_us = ts, clock_us = clock, "dropping late video frame");
                        continue;
                    }
                    out.push((entry.timestamp_us, entry.item));
                }
            }
            None => {
                let Some((first_arrival, first_ts)) = self.anchor else {
                    return out;
                };
                let elapsed = now.saturating_duration_since(first_arrival);
                while let Some(front) = self.frames.front() {
                    let offset = Duration::from_micros(front.timestamp_us.saturating_sub(first_ts) as u64);
                    if elapsed < self.config.jitter_delay + offset {
                        break;
                    }
                    if let Some(entry) = self.frames.pop_front() {
                        out.push((entry.timestamp_us, entry.item));
                    }
                }
            }
        }
        self.frames_released += out.len() as u64;
        out
    }

    /// Time until the next frame is due without an audio clock.
    pub fn next_due(&self, now: Instant) -> Option<Duration> {
        let (first_arrival, first_ts) = self.anchor?;
        let front = self.frames.front()?;
        let offset = Duration::from_micros(front.timestamp_us.saturating_sub(first_ts) as u64);
        let due = self.config.jitter_delay + offset;
        Some(due.saturating_sub(now.saturating_duration_since(first_arrival)))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Drop everything and restart pacing (tier switch, reconnect).
    pub fn clear(&mut self) {
        self.frames.clear();
        self.anchor = None;
    }
}

impl<T> Default for PlayoutBuffer<T> {
    fn default() -> Self {
        Self::new(PlayoutConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_buffers_until_config_then_passes() {
        let mut gate = ConfigGate::new(8);
        assert_eq!(gate.offer(1), GateOutcome::Held);
        assert_eq!(gate.offer(2), GateOutcome::Held);
        assert_eq!(gate.apply_config(), Some(vec![1, 2]));
        assert_eq!(gate.offer(3), GateOutcome::Pass(3));
    }

    #[test]
    fn gate_ignores_duplicate_config() {
        let mut gate: ConfigGate<u8> = ConfigGate::new(8);
        assert!(gate.apply_config().is_some());
        assert!(gate.apply_config().is_none());
        assert_eq!(gate.duplicate_configs, 1);
    }

    #[test]
    fn gate_is_bounded() {
        let mut gate = ConfigGate::new(2);
        gate.offer(1);
        gate.offer(2);
        gate.offer(3);
        assert_eq!(gate.overflowed, 1);
        assert_eq!(gate.apply_config(), Some(vec![2, 3]));
    }

    #[test]
    fn playout_follows_audio_clock() {
        let mut buf = PlayoutBuffer::new(PlayoutConfig::default());
        let now = Instant::now();
        for ts in [0u32, 33_000, 66_000, 100_000] {
            buf.push(ts, ts, now);
        }
        // Clock at 40ms: frames 0 and 33ms are due, later ones wait.
        let out: Vec<u32> = buf.release(now, Some(40_000)).into_iter().map(|(t, _)| t).collect();
        assert_eq!(out, vec![0, 33_000]);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn playout_drops_frames_behind_clock() {
        let mut buf = PlayoutBuffer::new(PlayoutConfig::default());
        let now = Instant::now();
        buf.push(0, 'a', now);
        buf.push(150_000, 'b', now);
        buf.push(260_000, 'c', now);
        // 'a' is 300ms behind and 'b' 150ms behind: both beyond the 100ms threshold.
        let out = buf.release(now, Some(300_000));
        assert_eq!(out, vec![(260_000, 'c')]);
        assert_eq!(buf.frames_late, 2);
    }

    #[test]
    fn playout_reorders_by_timestamp() {
        let mut buf = PlayoutBuffer::new(PlayoutConfig::default());
        let now = Instant::now();
        buf.push(0, 0, now);
        buf.push(66_000, 2, now);
        buf.push(33_000, 1, now);
        let out: Vec<i32> = buf.release(now, Some(70_000)).into_iter().map(|(_, v)| v).collect();
        assert_eq!(out, vec![0, 1, 2]);
    }

    #[test]
    fn playout_without_audio_uses_jitter_delay() {
        let mut buf = PlayoutBuffer::new(PlayoutConfig {
            jitter_delay: Duration::from_millis(50),
            ..PlayoutConfig::default()
        });
        let t0 = Instant::now();
        buf.push(1_000_000, 'a', t0);
        buf.push(1_033_000, 'b', t0);

        assert!(buf.release(t0 + Duration::from_millis(10), None).is_empty());
        let out = buf.release(t0 + Duration::from_millis(60), None);
        assert_eq!(out, vec![(1_000_000, 'a')]);
        assert_eq!(
            buf.next_due(t0 + Duration::from_millis(60)),
            Some(Duration::from_millis(23))
        );
        let out = buf.release(t0 + Duration::from_millis(90), None);
        assert_eq!(out, vec![(1_033_000, 'b')]);
    }

    #[test]
    fn playout_bounded() {
        let mut buf = PlayoutBuffer::new(PlayoutConfig {
            max_frames: 2,
            ..PlayoutConfig::default()
        });
        let now = Instant::now();
        buf.push(1, (), now);
        buf.push(2, (), now);
        buf.push(3, (), now);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.frames_overflowed, 1);
    }
}
