#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Edge-case tests for the wire format: boundary sizes, corruption, truncation

use framenet::config::{HEADER_SIZE, MAGIC, MAX_PACKET_SIZE, PROTOCOL_VERSION};
use framenet::core::codec::{read_packet, PacketCodec};
use framenet::core::packet::{checksum, Packet};
use framenet::error::{PacketFault, ProtocolError};
use framenet::protocol::packet_type;
use framenet::utils::BufferPool;
use bytes::BytesMut;
use tokio_util::codec::Decoder;

fn header(packet_type: u16, length: u32, crc: u32, sequence: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_SIZE);
    bytes.extend_from_slice(&MAGIC.to_be_bytes());
    bytes.push(PROTOCOL_VERSION);
    bytes.extend_from_slice(&packet_type.to_be_bytes());
    bytes.extend_from_slice(&length.to_be_bytes());
    bytes.extend_from_slice(&crc.to_be_bytes());
    bytes.extend_from_slice(&sequence.to_be_bytes());
    bytes
}

// ============================================================================
// SIZE BOUNDARIES
// ============================================================================

#[test]
fn test_empty_payload() {
    let packet = Packet::new(packet_type::HEARTBEAT, Vec::new(), 1);
    let bytes = packet.to_bytes();
    assert_eq!(bytes.len(), HEADER_SIZE);

    let decoded = Packet::from_bytes(&bytes).expect("Should decode empty payload");
    assert!(decoded.payload().is_empty());
    assert!(decoded.is_heartbeat());
}

#[test]
fn test_payload_at_exact_limit() {
    let payload = vec![0xAB; 4096];
    let bytes = Packet::new(200, payload, 1).to_bytes();
    let decoded = Packet::from_bytes_with_limit(&bytes, 4096).expect("Limit is inclusive");
    assert_eq!(decoded.payload().len(), 4096);
}

#[test]
fn test_payload_one_over_limit() {
    let bytes = Packet::new(200, vec![0xAB; 4097], 1).to_bytes();
    assert!(matches!(
        Packet::from_bytes_with_limit(&bytes, 4096),
        Err(ProtocolError::PacketTooLarge {
            size: 4097,
            max: 4096
        })
    ));
}

#[test]
fn test_huge_length_claim_rejected_without_payload() {
    // header only, claiming more than the default maximum
    let bytes = header(200, (MAX_PACKET_SIZE + 1) as u32, 0, 1);
    match Packet::from_bytes(&bytes) {
        Err(ProtocolError::PacketTooLarge { size, max }) => {
            assert_eq!(size, MAX_PACKET_SIZE + 1);
            assert_eq!(max, MAX_PACKET_SIZE);
        }
        other => panic!("Unexpected result: {other:?}"),
    }
}

#[test]
fn test_max_u32_length_claim() {
    let bytes = header(200, u32::MAX, 0, 1);
    assert!(matches!(
        Packet::from_bytes(&bytes),
        Err(ProtocolError::PacketTooLarge { .. })
    ));
}

// ============================================================================
// CORRUPTION
// ============================================================================

#[test]
fn test_invalid_magic() {
    let mut bytes = Packet::new(5, b"hello".to_vec(), 1).to_bytes();
    bytes[0..4].copy_from_slice(&0xDEAD_BEEFu32.to_be_bytes());

    assert!(matches!(
        Packet::from_bytes(&bytes),
        Err(ProtocolError::InvalidMagic(0xDEAD_BEEF))
    ));
}

#[test]
fn test_unsupported_version() {
    let mut bytes = Packet::new(5, b"hello".to_vec(), 1).to_bytes();
    bytes[4] = PROTOCOL_VERSION + 1;

    assert!(matches!(
        Packet::from_bytes(&bytes),
        Err(ProtocolError::InvalidPacket(PacketFault::UnsupportedVersion(v))) if v == PROTOCOL_VERSION + 1
    ));
}

#[test]
fn test_flipped_payload_bit_fails_checksum() {
    let mut bytes = Packet::new(5, b"hello world".to_vec(), 1).to_bytes();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;

    match Packet::from_bytes(&bytes) {
        Err(ProtocolError::InvalidPacket(PacketFault::ChecksumMismatch { expected, actual })) => {
            assert_eq!(expected, checksum(b"hello world"));
            assert_ne!(expected, actual);
        }
        other => panic!("Expected checksum mismatch, got {other:?}"),
    }
}

#[test]
fn test_corrupted_checksum_field() {
    let mut bytes = Packet::new(5, b"abc".to_vec(), 1).to_bytes();
    bytes[11] ^= 0xFF;

    let err = Packet::from_bytes(&bytes).unwrap_err();
    assert!(err.is_framing());
}

#[test]
fn test_every_single_byte_flip_is_detected() {
    let original = Packet::new(300, b"integrity".to_vec(), 42).to_bytes();

    for i in 0..original.len() {
        // type and sequence bytes are not covered by the checksum
        if (5..7).contains(&i) || (15..19).contains(&i) {
            continue;
        }
        let mut bytes = original.clone();
        bytes[i] ^= 0x80;
        assert!(
            Packet::from_bytes(&bytes).is_err(),
            "Flip at byte {i} was not detected"
        );
    }
}

// ============================================================================
// TRUNCATION
// ============================================================================

#[test]
fn test_truncated_header() {
    let bytes = Packet::new(5, b"x".to_vec(), 1).to_bytes();
    assert!(matches!(
        Packet::from_bytes(&bytes[..HEADER_SIZE - 1]),
        Err(ProtocolError::ShortRead { .. })
    ));
}

#[test]
fn test_truncated_payload() {
    let bytes = Packet::new(5, b"truncate me".to_vec(), 1).to_bytes();
    assert!(matches!(
        Packet::from_bytes(&bytes[..bytes.len() - 1]),
        Err(ProtocolError::ShortRead { .. })
    ));
}

#[tokio::test]
async fn test_stream_truncated_mid_header() {
    let bytes = Packet::new(5, b"x".to_vec(), 1).to_bytes();
    let mut reader = &bytes[..7];
    let err = read_packet(&mut reader, &BufferPool::default(), MAX_PACKET_SIZE)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::ShortRead {
            expected: HEADER_SIZE,
            actual: 7
        }
    ));
}

#[tokio::test]
async fn test_stream_of_packets_back_to_back() {
    let packets: Vec<Packet> = (1..=20)
        .map(|seq| Packet::new(200, vec![seq as u8; seq as usize * 10], seq))
        .collect();
    let stream: Vec<u8> = packets.iter().flat_map(|p| p.to_bytes()).collect();

    let pool = BufferPool::new(2, 128);
    let mut reader = &stream[..];
    for expected in &packets {
        let decoded = read_packet(&mut reader, &pool, MAX_PACKET_SIZE)
            .await
            .unwrap();
        assert_eq!(&decoded, expected);
    }
    assert!(matches!(
        read_packet(&mut reader, &pool, MAX_PACKET_SIZE).await,
        Err(ProtocolError::ConnectionClosed)
    ));
}

#[test]
fn test_codec_decodes_byte_by_byte() {
    let packet = Packet::new(7, b"drip".to_vec(), 9);
    let bytes = packet.to_bytes();

    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::new();
    let mut decoded = None;
    for (i, byte) in bytes.iter().enumerate() {
        buf.extend_from_slice(&[*byte]);
        let result = codec.decode(&mut buf).unwrap();
        if i + 1 < bytes.len() {
            assert!(result.is_none());
        } else {
            decoded = result;
        }
    }
    assert_eq!(decoded, Some(packet));
}

#[test]
fn test_codec_rejects_oversized_header_early() {
    let mut codec = PacketCodec::new(64);
    let mut buf = BytesMut::from(&header(200, 65, 0, 1)[..]);
    assert!(matches!(
        codec.decode(&mut buf),
        Err(ProtocolError::PacketTooLarge { size: 65, max: 64 })
    ));
}

// ============================================================================
// REPLIES
// ============================================================================

#[test]
fn test_reply_carries_request_sequence() {
    let request = Packet::new(packet_type::DATA_JSON, br#"{"q":1}"#.to_vec(), 9001);
    let reply = Packet::reply(&request, packet_type::DATA_JSON, br#"{"a":2}"#.to_vec());
    assert_eq!(reply.sequence(), 9001);
    assert_eq!(reply.checksum(), checksum(br#"{"a":2}"#));
}
