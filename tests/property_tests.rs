//! Property-based tests using proptest
//!
//! Wire-format invariants checked over randomly generated packets and byte streams.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use framenet::config::{HEADER_SIZE, MAX_PACKET_SIZE};
use framenet::core::codec::PacketCodec;
use framenet::core::packet::{checksum, Packet};
use framenet::core::serialization::{MultiFormat, SerializationFormat};
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

// Property: decode(encode(p)) reproduces type, sequence and payload
proptest! {
    #[test]
    fn prop_packet_roundtrip(
        packet_type in any::<u16>(),
        sequence in any::<u32>(),
        payload in prop::collection::vec(any::<u8>(), 0..10000),
    ) {
        let packet = Packet::new(packet_type, payload.clone(), sequence);
        let decoded = Packet::from_bytes(&packet.to_bytes()).expect("Decoding should not fail");

        prop_assert_eq!(decoded.packet_type(), packet_type);
        prop_assert_eq!(decoded.sequence(), sequence);
        prop_assert_eq!(&decoded.payload()[..], &payload[..]);
    }
}

// Property: header length and checksum always describe the payload
proptest! {
    #[test]
    fn prop_header_describes_payload(payload in prop::collection::vec(any::<u8>(), 0..4096)) {
        let packet = Packet::new(200, payload.clone(), 1);
        prop_assert_eq!(packet.header().length as usize, payload.len());
        prop_assert_eq!(packet.checksum(), checksum(&payload));
        prop_assert_eq!(packet.encoded_len(), HEADER_SIZE + payload.len());
    }
}

// Property: arbitrary bytes never panic the decoder
proptest! {
    #[test]
    fn prop_random_bytes_never_panic(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = Packet::from_bytes(&data);

        let mut codec = PacketCodec::new(1024);
        let mut buf = BytesMut::from(&data[..]);
        let _ = codec.decode(&mut buf);
    }
}

// Property: the streaming codec yields the same packets regardless of how the stream is split
proptest! {
    #[test]
    fn prop_codec_chunking_invariant(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 1..8),
        chunk in 1usize..64,
    ) {
        let mut codec = PacketCodec::new(MAX_PACKET_SIZE);
        let mut wire = BytesMut::new();
        let packets: Vec<Packet> = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| Packet::new(300, payload, i as u32 + 1))
            .collect();
        for packet in &packets {
            codec.encode(packet.clone(), &mut wire).unwrap();
        }

        let mut decoded = Vec::new();
        let mut buf = BytesMut::new();
        for piece in wire.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some(packet) = codec.decode(&mut buf).unwrap() {
                decoded.push(packet);
            }
        }

        prop_assert!(buf.is_empty());
        prop_assert_eq!(decoded, packets);
    }
}

// Property: any single-byte corruption of the payload is detected
proptest! {
    #[test]
    fn prop_payload_corruption_detected(
        payload in prop::collection::vec(any::<u8>(), 1..2048),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let mut bytes = Packet::new(200, payload.clone(), 7).to_bytes();
        let at = HEADER_SIZE + index.index(payload.len());
        bytes[at] ^= flip;

        prop_assert!(Packet::from_bytes(&bytes).is_err());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u64,
    items: Vec<String>,
    total_cents: i64,
}

fn order_strategy() -> impl Strategy<Value = Order> {
    (
        any::<u64>(),
        prop::collection::vec("[a-z]{0,12}", 0..8),
        any::<i64>(),
    )
        .prop_map(|(id, items, total_cents)| Order {
            id,
            items,
            total_cents,
        })
}

// Property: payload serialization round-trips in every format
proptest! {
    #[test]
    fn prop_serialization_roundtrip(order in order_strategy()) {
        for format in [
            SerializationFormat::Bincode,
            SerializationFormat::Json,
            SerializationFormat::MessagePack,
        ] {
            let bytes = order.serialize_with_header(format).unwrap();
            let (decoded, detected) = Order::deserialize_with_header(&bytes).unwrap();
            prop_assert_eq!(detected, format);
            prop_assert_eq!(&decoded, &order);
        }
    }
}
