//! # Channel State
//!
//! Per-channel protocol state shared by the publish and subscribe sides:
//! sequence numbering, decoder-config handshake flags, the outbound queue
//! that absorbs transport backpressure, and receive-side gap detection.
//!
//! Pure logic; the engine's registry owns the pipes and calls in here.

use bytes::Bytes;
use std::collections::VecDeque;
use thiserror::Error;

use crate::stats::ChannelStats;
use crate::wire::{ChannelName, ChannelRole};

// ─── Sequence Counter ───────────────────────────────────────────────────────

/// Monotonic per-channel sequence numbers, wrapping silently at 2^32.
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter {
    next: u32,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an arbitrary value (used by tests around the wrap point).
    pub fn starting_at(next: u32) -> Self {
        SequenceCounter { next }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u32 {
        let seq = self.next;
        self.next = self.next.wrapping_add(1);
        seq
    }

    /// The value the next call will return.
    pub fn peek(&self) -> u32 {
        self.next
    }
}

// ─── Outbound Queue ─────────────────────────────────────────────────────────

/// Water marks for transports that report a send-buffer level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureConfig {
    /// Queue locally once the transport buffers more than this many bytes.
    pub high_water: usize,
    /// Resume draining once the transport buffer is at or below this level.
    pub low_water: usize,
    /// Upper bound on locally queued bytes.
    pub max_queued_bytes: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        BackpressureConfig {
            high_water: 1024 * 1024,
            low_water: 256 * 1024,
            max_queued_bytes: 8 * 1024 * 1024,
        }
    }
}

/// The local queue would grow past its bound.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("outbound queue full: {queued} bytes queued, limit {limit}")]
pub struct CapacityExceeded {
    pub queued: usize,
    pub limit: usize,
}

/// What to do with an offered packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Write it to the transport now.
    SendNow(Bytes),
    /// Held locally until the transport drains.
    Queued,
}

/// FIFO with high/low water-mark hysteresis.
///
/// Once the transport's buffered amount rises above `high_water` every packet
/// queues (including ones that would fit) until the buffer falls to
/// `low_water`, so submission order is preserved.
#[derive(Debug)]
pub struct OutboundQueue {
    config: BackpressureConfig,
    queue: VecDeque<Bytes>,
    queued_bytes: usize,
    paused: bool,
}

impl OutboundQueue {
    pub fn new(config: BackpressureConfig) -> Self {
        OutboundQueue {
            config,
            queue: VecDeque::new(),
            queued_bytes: 0,
            paused: false,
        }
    }

    /// Offer a packet given the transport's current buffered amount.
    pub fn offer(&mut self, packet: Bytes, buffered: usize) -> Result<Admission, CapacityExceeded> {
        if !self.paused && buffered > self.config.high_water {
            self.paused = true;
        }

        if !self.paused && self.queue.is_empty() {
            return Ok(Admission::SendNow(packet));
        }

        let projected = self.queued_bytes + packet.len();
        if projected > self.config.max_queued_bytes {
            return Err(CapacityExceeded {
                queued: self.queued_bytes,
                limit: self.config.max_queued_bytes,
            });
        }
        self.queued_bytes = projected;
        self.queue.push_back(packet);
        Ok(Admission::Queued)
    }

    /// Release queued packets the transport can take now.
    ///
    /// Returns nothing while paused above the low-water mark. Otherwise pops
    /// packets until the projected buffer would cross `high_water` again.
    pub fn drain(&mut self, buffered: usize) -> Vec<Bytes> {
        if self.paused && buffered > self.config.low_water {
            return Vec::new();
        }
        self.paused = false;

        let mut projected = buffered;
        let mut out = Vec::new();
        while let Some(front) = self.queue.front() {
            if projected > self.config.high_water {
                self.paused = true;
                break;
            }
            projected += front.len();
            self.queued_bytes -= front.len();
            if let Some(pkt) = self.queue.pop_front() {
                out.push(pkt);
            }
        }
        out
    }

    /// Take everything regardless of water marks (used on close).
    pub fn flush_all(&mut self) -> Vec<Bytes> {
        self.queued_bytes = 0;
        self.paused = false;
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

// ─── Channel State ──────────────────────────────────────────────────────────

/// Protocol state of one named channel.
#[derive(Debug)]
pub struct ChannelState {
    name: ChannelName,
    sequence: SequenceCounter,
    config_sent: bool,
    /// Encoded config waiting for the channel to become writable.
    pending_config: Option<Bytes>,
    pub outbound: OutboundQueue,
    pub stats: ChannelStats,
}

impl ChannelState {
    pub fn new(name: ChannelName, backpressure: BackpressureConfig) -> Self {
        ChannelState {
            name,
            sequence: SequenceCounter::new(),
            config_sent: false,
            pending_config: None,
            outbound: OutboundQueue::new(backpressure),
            stats: ChannelStats::default(),
        }
    }

    pub fn name(&self) -> ChannelName {
        self.name
    }

    pub fn role(&self) -> ChannelRole {
        self.name.role()
    }

    pub fn next_sequence(&mut self) -> u32 {
        self.sequence.next()
    }

    pub fn peek_sequence(&self) -> u32 {
        self.sequence.peek()
    }

    pub fn mark_config_sent(&mut self) {
        self.config_sent = true;
        self.pending_config = None;
    }

    pub fn is_config_sent(&self) -> bool {
        self.config_sent
    }

    /// Forget the handshake so the config is sent again (new connection).
    pub fn reset_config(&mut self) {
        self.config_sent = false;
    }

    pub fn set_pending_config(&mut self, config: Bytes) {
        self.pending_config = Some(config);
    }

    pub fn pending_config(&self) -> Option<&Bytes> {
        self.pending_config.as_ref()
    }

    pub fn take_pending_config(&mut self) -> Option<Bytes> {
        self.pending_config.take()
    }
}

// ─── Sequence Tracker (Receiver-Side) ───────────────────────────────────────

/// Classification of a received sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// First packet seen on the channel.
    First,
    /// Exactly the expected next sequence.
    InOrder,
    /// Ahead of expectation; `missing` packets were skipped.
    Gap { missing: u32 },
    /// Behind the highest seen (duplicate or reordered).
    Late,
    /// Jump larger than the reset threshold; tracking restarted.
    Reset,
}

/// Detects skipped sequence numbers modulo 2^32.
///
/// Gaps are reported, never retransmitted.
#[derive(Debug, Clone)]
pub struct SequenceTracker {
    last: Option<u32>,
    max_gap: u32,
    pub gaps: u64,
    pub missing: u64,
    pub late: u64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        SequenceTracker {
            last: None,
            max_gap: 10_000,
            gaps: 0,
            missing: 0,
            late: 0,
        }
    }

    pub fn with_max_gap(mut self, max_gap: u32) -> Self {
        self.max_gap = max_gap;
        self
    }

    pub fn record(&mut self, seq: u32) -> SequenceCheck {
        let Some(last) = self.last else {
            self.last = Some(seq);
            return SequenceCheck::First;
        };

        let expected = last.wrapping_add(1);
        let ahead = seq.wrapping_sub(expected);
        if ahead == 0 {
            self.last = Some(seq);
            SequenceCheck::InOrder
        } else if ahead < (1 << 31) {
            self.last = Some(seq);
            if ahead > self.max_gap {
                SequenceCheck::Reset
            } else {
                self.gaps += 1;
                self.missing += ahead as u64;
                SequenceCheck::Gap { missing: ahead }
            }
        } else {
            self.late += 1;
            SequenceCheck::Late
        }
    }

    /// Highest sequence accepted so far.
    pub fn last_seen(&self) -> Option<u32> {
        self.last
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::VideoTier;

    #[test]
    fn sequence_counter_wraps_silently() {
        let mut c = SequenceCounter::starting_at(u32::MAX - 1);
        assert_eq!(c.next(), u32::MAX - 1);
        assert_eq!(c.next(), u32::MAX);
        assert_eq!(c.next(), 0);
        assert_eq!(c.peek(), 1);
    }

    fn small_queue() -> OutboundQueue {
        OutboundQueue::new(BackpressureConfig {
            high_water: 100,
            low_water: 40,
            max_queued_bytes: 50,
        })
    }

    #[test]
    fn queue_passes_through_below_high_water() {
        let mut q = small_queue();
        let pkt = Bytes::from_static(&[1; 10]);
        assert_eq!(q.offer(pkt.clone(), 0).unwrap(), Admission::SendNow(pkt.clone()));
        assert_eq!(q.offer(pkt.clone(), 100).unwrap(), Admission::SendNow(pkt));
        assert!(q.is_empty());
    }

    #[test]
    fn queue_pauses_until_low_water() {
        let mut q = small_queue();
        let a = Bytes::from_static(&[1; 10]);
        let b = Bytes::from_static(&[2; 10]);
        assert_eq!(q.offer(a.clone(), 101).unwrap(), Admission::Queued);
        assert!(q.is_paused());
        // Buffer drops but stays above low water: still paused, still queued.
        assert_eq!(q.offer(b.clone(), 60).unwrap(), Admission::Queued);
        assert!(q.drain(60).is_empty());
        assert_eq!(q.drain(40), vec![a, b]);
        assert!(!q.is_paused());
        assert_eq!(q.queued_bytes(), 0);
    }

    #[test]
    fn queue_preserves_order_while_nonempty() {
        let mut q = small_queue();
        let a = Bytes::from_static(&[1; 10]);
        let b = Bytes::from_static(&[2; 10]);
        q.offer(a.clone(), 200).unwrap();
        // Drain only partially: projected buffer crosses high water after `a`.
        assert_eq!(q.drain(95), vec![a]);
        // Transport is low again but a packet is still queued behind: must queue.
        q.offer(b.clone(), 200).unwrap();
        assert_eq!(q.drain(0), vec![b]);
    }

    #[test]
    fn queue_bound_is_capacity_exceeded() {
        let mut q = small_queue();
        q.offer(Bytes::from_static(&[0; 30]), 500).unwrap();
        let err = q.offer(Bytes::from_static(&[0; 30]), 500).unwrap_err();
        assert_eq!(err, CapacityExceeded { queued: 30, limit: 50 });
        assert_eq!(q.flush_all().len(), 1);
    }

    #[test]
    fn channel_config_handshake() {
        let mut ch = ChannelState::new(ChannelName::Camera(VideoTier::High), BackpressureConfig::default());
        assert_eq!(ch.role(), ChannelRole::VideoTier);
        assert!(!ch.is_config_sent());
        ch.set_pending_config(Bytes::from_static(b"{}"));
        assert!(ch.pending_config().is_some());
        ch.mark_config_sent();
        assert!(ch.is_config_sent());
        assert!(ch.pending_config().is_none());
        ch.reset_config();
        assert!(!ch.is_config_sent());
        assert_eq!(ch.next_sequence(), 0);
        assert_eq!(ch.next_sequence(), 1);
    }

    #[test]
    fn tracker_reports_gaps_and_late() {
        let mut t = SequenceTracker::new();
        assert_eq!(t.record(5), SequenceCheck::First);
        assert_eq!(t.record(6), SequenceCheck::InOrder);
        assert_eq!(t.record(9), SequenceCheck::Gap { missing: 2 });
        assert_eq!(t.record(7), SequenceCheck::Late);
        assert_eq!(t.record(9), SequenceCheck::Late);
        assert_eq!(t.gaps, 1);
        assert_eq!(t.missing, 2);
        assert_eq!(t.late, 2);
    }

    #[test]
    fn tracker_accepts_wraparound() {
        let mut t = SequenceTracker::new();
        t.record(u32::MAX - 1);
        assert_eq!(t.record(u32::MAX), SequenceCheck::InOrder);
        assert_eq!(t.record(0), SequenceCheck::InOrder);
        assert_eq!(t.record(2), SequenceCheck::Gap { missing: 1 });
    }

    #[test]
    fn tracker_resets_on_huge_jump() {
        let mut t = SequenceTracker::new().with_max_gap(100);
        t.record(0);
        assert_eq!(t.record(5_000), SequenceCheck::Reset);
        assert_eq!(t.record(5_001), SequenceCheck::InOrder);
    }
}
