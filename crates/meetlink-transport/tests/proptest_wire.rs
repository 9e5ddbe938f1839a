//! Property-based tests for the meetlink wire format.
//!
//! Header round trips across the full sequence range and every frame type,
//! rejection of corrupt headers, and stream framing under arbitrary splits.

use bytes::Bytes;
use meetlink_transport::wire::*;
use proptest::prelude::*;

fn frame_type() -> impl Strategy<Value = FrameType> {
    let tier = (0u8..4).prop_map(|i| VideoTier::from_index(i).unwrap());
    prop_oneof![
        tier.clone().prop_map(FrameType::VideoKey),
        tier.clone().prop_map(FrameType::VideoDelta),
        tier.clone().prop_map(FrameType::ScreenKey),
        tier.prop_map(FrameType::ScreenDelta),
        Just(FrameType::Audio),
        Just(FrameType::ScreenAudio),
        Just(FrameType::Config),
        Just(FrameType::Event),
        Just(FrameType::Ping),
    ]
}

fn fec_config() -> impl Strategy<Value = FecConfig> {
    (any::<u64>(), any::<u16>(), any::<u8>(), any::<u16>(), any::<u8>()).prop_map(
        |(transfer_length, symbol_size, source_blocks, sub_blocks, alignment)| FecConfig {
            transfer_length,
            symbol_size,
            source_blocks,
            sub_blocks,
            alignment,
        },
    )
}

proptest! {
    #[test]
    fn regular_roundtrip(
        seq in any::<u32>(),
        ft in frame_type(),
        payload in proptest::collection::vec(any::<u8>(), 0..2048),
    ) {
        let bytes = encode_regular(&payload, seq, ft);
        prop_assert_eq!(bytes.len(), REGULAR_HEADER_LEN + payload.len());
        let pkt = decode(bytes).unwrap();
        prop_assert_eq!(pkt.sequence, seq);
        prop_assert_eq!(pkt.frame_type, ft);
        prop_assert!(pkt.fec.is_none());
        prop_assert_eq!(&pkt.payload[..], &payload[..]);
    }

    #[test]
    fn fec_roundtrip(
        seq in any::<u32>(),
        ft in frame_type(),
        cfg in fec_config(),
        symbol in proptest::collection::vec(any::<u8>(), 0..1100),
    ) {
        let bytes = encode_fec(&symbol, seq, ft, &cfg);
        prop_assert_eq!(bytes.len(), FEC_HEADER_LEN + symbol.len());
        let pkt = decode(bytes.clone()).unwrap();
        prop_assert_eq!(pkt.sequence, seq);
        prop_assert_eq!(pkt.frame_type, ft);
        prop_assert_eq!(pkt.fec, Some(cfg));
        prop_assert_eq!(&pkt.payload[..], &symbol[..]);
        // Re-encoding the decoded packet is byte-exact.
        prop_assert_eq!(pkt.encode(), bytes);
    }

    #[test]
    fn unknown_marker_rejected(
        seq in any::<u32>(),
        marker in 1u8..0xFF,
        payload in proptest::collection::vec(any::<u8>(), 0..64),
    ) {
        let mut raw = encode_regular(&payload, seq, FrameType::Audio).to_vec();
        raw[FEC_MARKER_OFFSET] = marker;
        prop_assert_eq!(
            decode(Bytes::from(raw)).unwrap_err(),
            MalformedPacket::UnknownMarker(marker)
        );
    }

    #[test]
    fn short_buffers_never_panic(raw in proptest::collection::vec(any::<u8>(), 0..REGULAR_HEADER_LEN)) {
        let is_too_short = matches!(
            decode(Bytes::from(raw)),
            Err(MalformedPacket::TooShort { .. })
        );
        prop_assert!(is_too_short);
    }

    #[test]
    fn arbitrary_bytes_never_panic(raw in proptest::collection::vec(any::<u8>(), 0..64)) {
        let _ = decode(Bytes::from(raw));
    }

    #[test]
    fn frame_type_byte_bijection(b in any::<u8>()) {
        if let Some(ft) = FrameType::from_byte(b) {
            prop_assert_eq!(ft.to_byte(), b);
        }
    }

    #[test]
    fn channel_name_id_and_string_roundtrip(id in any::<u8>()) {
        if let Some(name) = ChannelName::from_id(id) {
            prop_assert_eq!(name.id(), id);
            let parsed: ChannelName = name.to_string().parse().unwrap();
            prop_assert_eq!(parsed, name);
        }
    }

    #[test]
    fn reassembler_handles_any_split(
        packets in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..300), 1..8),
        chunk in 1usize..97,
    ) {
        let stream: Vec<u8> = packets.iter().flat_map(|p| encode_frame(p).to_vec()).collect();
        let mut r = FrameReassembler::new();
        let mut out = Vec::new();
        for part in stream.chunks(chunk) {
            r.push(part);
            while let Some(frame) = r.next_frame().unwrap() {
                out.push(frame.to_vec());
            }
        }
        prop_assert_eq!(out, packets);
        prop_assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn media_timestamp_saturates(ts in any::<u64>(), data in proptest::collection::vec(any::<u8>(), 0..32)) {
        let frame = MediaFrame::new(ts, Bytes::from(data));
        let expected = ts.min(u32::MAX as u64) as u32;
        prop_assert_eq!(frame.timestamp_us, expected);
        let decoded = MediaFrame::decode(frame.encode()).unwrap();
        prop_assert_eq!(decoded, frame);
    }
}
