//! Packet layout and validation.
//!
//! ```text
//! [Magic(4)] [Version(1)] [Type(2)] [Length(4)] [Checksum(4)] [Sequence(4)] [Payload(N)]
//! ```
//!
//! All header fields are big-endian. The checksum is CRC-32 (IEEE) over the payload only.
//! A [`Packet`] can only be built through [`Packet::new`] (and the reply helpers) or by
//! decoding, so every instance satisfies `length == payload.len()` and
//! `checksum == crc32(payload)`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::{HEADER_SIZE, MAGIC, MAX_PACKET_SIZE, PROTOCOL_VERSION};
use crate::error::{PacketFault, ProtocolError, Result};
use crate::protocol::packet_type;

/// CRC-32 (IEEE 802.3 polynomial) of a payload
#[inline]
pub fn checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Header length field for a payload of `len` bytes
fn wire_length(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| ProtocolError::PacketTooLarge {
        size: len,
        max: u32::MAX as usize,
    })
}

/// Fixed-size header preceding every payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u8,
    pub packet_type: u16,
    pub length: u32,
    pub checksum: u32,
    pub sequence: u32,
}

impl PacketHeader {
    /// Serialize header into `dst` in network byte order.
    pub fn write_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_u32(self.magic);
        dst.put_u8(self.version);
        dst.put_u16(self.packet_type);
        dst.put_u32(self.length);
        dst.put_u32(self.checksum);
        dst.put_u32(self.sequence);
    }

    /// Parse the first `HEADER_SIZE` bytes of `buf` without validating them.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::ShortRead {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }

        Ok(Self {
            magic: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            version: buf[4],
            packet_type: u16::from_be_bytes([buf[5], buf[6]]),
            length: u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]),
            checksum: u32::from_be_bytes([buf[11], buf[12], buf[13], buf[14]]),
            sequence: u32::from_be_bytes([buf[15], buf[16], buf[17], buf[18]]),
        })
    }

    /// Checks that must pass before any payload byte is read.
    pub fn check_prefix(&self, max_packet_size: usize) -> Result<()> {
        if self.magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(self.magic));
        }

        let size = self.length as usize;
        if size > max_packet_size {
            return Err(ProtocolError::PacketTooLarge {
                size,
                max: max_packet_size,
            });
        }

        Ok(())
    }
}

/// One framed unit of wire data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    header: PacketHeader,
    payload: Bytes,
}

impl Packet {
    /// Build a packet, computing length and checksum from `payload`.
    ///
    /// The length field is 32 bits wide; use [`try_new`](Self::try_new) when the
    /// payload size is not already bounded by a configured packet limit.
    pub fn new(packet_type: u16, payload: impl Into<Bytes>, sequence: u32) -> Self {
        let payload = payload.into();
        debug_assert!(wire_length(payload.len()).is_ok(), "payload exceeds u32 length field");
        Self::assemble(packet_type, payload, sequence)
    }

    /// Like [`new`](Self::new), but rejects payloads whose length does not fit the header.
    pub fn try_new(packet_type: u16, payload: impl Into<Bytes>, sequence: u32) -> Result<Self> {
        let payload = payload.into();
        wire_length(payload.len())?;
        Ok(Self::assemble(packet_type, payload, sequence))
    }

    fn assemble(packet_type: u16, payload: Bytes, sequence: u32) -> Self {
        let header = PacketHeader {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            packet_type,
            length: payload.len() as u32,
            checksum: checksum(&payload),
            sequence,
        };

        Self { header, payload }
    }

    /// Acknowledgement echoing the payload and sequence of `request`.
    pub fn ack(request: &Packet) -> Self {
        Self::new(packet_type::ACK, request.payload.clone(), request.sequence())
    }

    /// Response of `packet_type` correlated to `request` through its sequence.
    pub fn reply(request: &Packet, packet_type: u16, payload: impl Into<Bytes>) -> Self {
        Self::new(packet_type, payload, request.sequence())
    }

    /// Assemble a decoded header and payload, running the post-read checks.
    pub(crate) fn from_parts(header: PacketHeader, payload: Bytes) -> Result<Self> {
        if header.length as usize != payload.len() {
            return Err(ProtocolError::ShortRead {
                expected: header.length as usize,
                actual: payload.len(),
            });
        }

        if header.version != PROTOCOL_VERSION {
            return Err(ProtocolError::InvalidPacket(
                PacketFault::UnsupportedVersion(header.version),
            ));
        }

        let actual = checksum(&payload);
        if actual != header.checksum {
            return Err(ProtocolError::InvalidPacket(PacketFault::ChecksumMismatch {
                expected: header.checksum,
                actual,
            }));
        }

        Ok(Self { header, payload })
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn packet_type(&self) -> u16 {
        self.header.packet_type
    }

    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    pub fn checksum(&self) -> u32 {
        self.header.checksum
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn is_heartbeat(&self) -> bool {
        self.header.packet_type == packet_type::HEARTBEAT
    }

    /// Size of the packet on the wire
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Append the wire representation to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        self.header.write_to(dst);
        dst.put_slice(&self.payload);
    }

    /// Wire representation as an owned buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.header.write_to(&mut out);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode one packet from the start of `data` with the default size limit.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::from_bytes_with_limit(data, MAX_PACKET_SIZE)
    }

    /// Decode one packet from the start of `data`. Trailing bytes are ignored.
    pub fn from_bytes_with_limit(data: &[u8], max_packet_size: usize) -> Result<Self> {
        let header = PacketHeader::parse(data)?;
        header.check_prefix(max_packet_size)?;

        let end = HEADER_SIZE + header.length as usize;
        if data.len() < end {
            return Err(ProtocolError::ShortRead {
                expected: end,
                actual: data.len(),
            });
        }

        Self::from_parts(header, Bytes::copy_from_slice(&data[HEADER_SIZE..end]))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn test_header_layout() {
        let packet = Packet::new(0x0102, b"ab".to_vec(), 0x0A0B0C0D);
        let bytes = packet.to_bytes();

        assert_eq!(bytes.len(), HEADER_SIZE + 2);
        assert_eq!(&bytes[0..4], &MAGIC.to_be_bytes());
        assert_eq!(bytes[4], PROTOCOL_VERSION);
        assert_eq!(&bytes[5..7], &[0x01, 0x02]);
        assert_eq!(&bytes[7..11], &2u32.to_be_bytes());
        assert_eq!(&bytes[11..15], &checksum(b"ab").to_be_bytes());
        assert_eq!(&bytes[15..19], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&bytes[19..], b"ab");
    }

    #[test]
    fn test_encode_into_matches_to_bytes() {
        let packet = Packet::new(9, b"payload".to_vec(), 3);
        let mut buf = BytesMut::new();
        packet.encode_into(&mut buf);
        assert_eq!(&buf[..], &packet.to_bytes()[..]);
    }

    #[test]
    fn test_ack_keeps_sequence_and_payload() {
        let ping = Packet::new(packet_type::HEARTBEAT, b"b".to_vec(), 77);
        let ack = Packet::ack(&ping);
        assert_eq!(ack.packet_type(), packet_type::ACK);
        assert_eq!(ack.sequence(), 77);
        assert_eq!(ack.payload(), ping.payload());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let header = Packet::new(1, b"abc".to_vec(), 1).header;
        let err = Packet::from_parts(header, Bytes::from_static(b"ab")).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ShortRead {
                expected: 3,
                actual: 2
            }
        ));
    }

    #[test]
    fn test_checksum_is_ieee_crc32() {
        assert_eq!(checksum(b"123456789"), 0xCBF4_3926);
        assert_eq!(checksum(b"The quick brown fox jumps over the lazy dog"), 0x414F_A339);
    }

    #[test]
    fn test_wire_length_bounds() {
        assert_eq!(wire_length(0).unwrap(), 0);
        assert_eq!(wire_length(u32::MAX as usize).unwrap(), u32::MAX);

        #[cfg(target_pointer_width = "64")]
        assert!(matches!(
            wire_length(u32::MAX as usize + 1),
            Err(ProtocolError::PacketTooLarge { max, .. }) if max == u32::MAX as usize
        ));
    }

    #[test]
    fn test_try_new_matches_new() {
        let packet = Packet::try_new(3, b"abc".to_vec(), 9).unwrap();
        assert_eq!(packet, Packet::new(3, b"abc".to_vec(), 9));
        assert_eq!(packet.header().length, 3);
    }

    #[test]
    fn test_empty_payload_checksum() {
        let packet = Packet::new(1, Bytes::new(), 0);
        assert_eq!(packet.checksum(), 0);
        assert_eq!(Packet::from_bytes(&packet.to_bytes()).unwrap(), packet);
    }
}
