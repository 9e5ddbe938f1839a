//! # Transport Statistics
//!
//! Per-channel and per-stream counters for the meetlink engine.
//! All stats serialize to JSON for status reporting.

use serde::Serialize;

// ─── Channel Stats ──────────────────────────────────────────────────────────

/// Publish-side statistics for one channel.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelStats {
    /// Packets written or queued (config, media and FEC symbols).
    pub packets_sent: u64,
    /// Packet bytes including headers.
    pub bytes_sent: u64,
    /// FEC symbols among `packets_sent`.
    pub fec_symbols_sent: u64,
    /// Packets that had to wait in the outbound queue.
    pub packets_queued: u64,
    /// Packets rejected because the outbound queue was full.
    pub packets_rejected: u64,
    /// Decoder configs sent (once per connection).
    pub configs_sent: u64,
}

impl ChannelStats {
    pub fn record_sent(&mut self, len: usize, fec: bool) {
        self.packets_sent += 1;
        self.bytes_sent += len as u64;
        if fec {
            self.fec_symbols_sent += 1;
        }
    }

    /// Fraction of sent packets that were FEC symbols.
    pub fn fec_overhead(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.fec_symbols_sent as f64 / self.packets_sent as f64
        }
    }
}

// ─── Receiver Stats ─────────────────────────────────────────────────────────

/// Receive-side statistics for one remote stream.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    /// Packets read from pipes.
    pub packets_received: u64,
    pub bytes_received: u64,
    /// Packets that failed header decoding.
    pub malformed: u64,
    /// Sequence gaps observed (not retransmitted).
    pub gaps: u64,
    /// Packets missing according to the gaps.
    pub packets_missing: u64,
    /// Packets older than the highest sequence seen.
    pub late_packets: u64,
    /// FEC blocks reconstructed.
    pub fec_recovered: u64,
    /// FEC blocks whose window closed before K symbols arrived.
    pub fec_dropped: u64,
    /// Media held back waiting for a decoder config.
    pub gated: u64,
    /// Media dropped because the pre-config buffer overflowed.
    pub gate_overflow: u64,
    pub frames_decoded: u64,
    pub decode_errors: u64,
    /// Jobs dropped because the decode queue was full.
    pub decode_queue_dropped: u64,
    /// Video frames dropped by the playout buffer as too late.
    pub frames_late: u64,
}

impl ReceiverStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observed loss rate from sequence gaps.
    pub fn loss_rate(&self) -> f64 {
        let expected = self.packets_received + self.packets_missing;
        if expected == 0 {
            0.0
        } else {
            self.packets_missing as f64 / expected as f64
        }
    }
}

// ─── Publisher Stats ────────────────────────────────────────────────────────

/// Encode-side counters for a publisher.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PublisherStats {
    pub frames_captured: u64,
    pub frames_encoded: u64,
    /// Frames skipped because the encoder queue was full.
    pub frames_dropped_backpressure: u64,
    pub key_frames: u64,
    pub audio_chunks: u64,
    /// Audio chunks without the `OggS` magic.
    pub audio_chunks_invalid: u64,
    pub encode_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_rate_from_gaps() {
        let mut s = ReceiverStats::new();
        assert_eq!(s.loss_rate(), 0.0);
        s.packets_received = 90;
        s.packets_missing = 10;
        assert!((s.loss_rate() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn channel_stats_counts_fec() {
        let mut s = ChannelStats::default();
        s.record_sent(100, false);
        s.record_sent(100, true);
        assert_eq!(s.bytes_sent, 200);
        assert!((s.fec_overhead() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn stats_serialize_to_json() {
        let s = ReceiverStats::default();
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"packets_received\":0"));
    }
}
