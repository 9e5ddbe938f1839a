//! Property-based tests for the Reed-Solomon block coder.
//!
//! Recovery from any K-of-(K+R) subset, failure below K, and the receive
//! assembler reconstructing blocks from shuffled symbol packets.

use bytes::Bytes;
use meetlink_transport::fec::{self, AssemblyEvent, FecAssembler, FecError};
use meetlink_transport::wire::{self, FrameType, VideoTier};
use proptest::prelude::*;

fn payload(len: usize, seed: u64) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u64).wrapping_mul(31).wrapping_add(seed) as u8)
        .collect()
}

/// Deterministic Fisher-Yates driven by `seed`, so shrinking stays stable.
fn shuffle<T>(items: &mut [T], mut seed: u64) {
    for i in (1..items.len()).rev() {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let j = (seed >> 33) as usize % (i + 1);
        items.swap(i, j);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn recovers_from_any_k_symbols(
        len in 1usize..6000,
        redundancy in 1u32..6,
        seed in any::<u64>(),
    ) {
        let data = payload(len, seed);
        let block = fec::encode(&data, 512, redundancy).unwrap();
        let k = block.config.source_blocks as usize;

        let mut symbols = block.symbols.clone();
        shuffle(&mut symbols, seed);
        symbols.truncate(k);

        let recovered = fec::decode(&block.config_bytes(), &symbols).unwrap();
        prop_assert_eq!(&recovered[..], &data[..]);
    }

    #[test]
    fn fails_below_k(
        len in 600usize..6000,
        redundancy in 1u32..4,
        seed in any::<u64>(),
    ) {
        let data = payload(len, seed);
        let block = fec::encode(&data, 512, redundancy).unwrap();
        let k = block.config.source_blocks as usize;

        let mut symbols = block.symbols.clone();
        shuffle(&mut symbols, seed);
        symbols.truncate(k - 1);

        let err = fec::decode(&block.config_bytes(), &symbols).unwrap_err();
        prop_assert_eq!(err, FecError::InsufficientSymbols { have: k - 1, need: k });
    }

    #[test]
    fn assembler_recovers_shuffled_packets(
        len in 1usize..5000,
        drop in 0usize..3,
        seed in any::<u64>(),
        base_seq in any::<u32>(),
    ) {
        let data = payload(len, seed);
        let block = fec::encode(&data, 256, 3).unwrap();
        let ft = FrameType::VideoKey(VideoTier::Medium);
        let mut seq = base_seq;
        let mut packets = fec::packetize(&block, ft, || {
            let s = seq;
            seq = seq.wrapping_add(1);
            s
        });
        shuffle(&mut packets, seed);
        packets.truncate(packets.len() - drop);

        let mut asm = FecAssembler::default();
        let mut recovered: Option<Bytes> = None;
        for raw in packets {
            let pkt = wire::decode(raw).unwrap();
            match asm.push(&pkt).unwrap() {
                AssemblyEvent::Recovered { block, frame_type, payload } => {
                    prop_assert!(recovered.is_none());
                    prop_assert_eq!(block, base_seq);
                    prop_assert_eq!(frame_type, ft);
                    recovered = Some(payload);
                }
                AssemblyEvent::Pending => prop_assert!(recovered.is_none()),
                AssemblyEvent::Stale => prop_assert!(recovered.is_some()),
            }
        }
        prop_assert_eq!(recovered.as_deref(), Some(&data[..]));
        prop_assert_eq!(asm.pending_blocks(), 0);
    }
}
