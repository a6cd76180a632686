//! Packet codecs.
//!
//! Two ways to turn bytes into packets:
//! - [`read_packet`] pulls exactly one packet off an `AsyncRead` with two bounded
//!   reads (header, then payload). The connection read path uses it.
//! - [`PacketCodec`] is a `tokio_util::codec` encoder/decoder for `Framed` and
//!   `FramedWrite` transports. The connection write path uses it.
//!
//! Both reject a header whose length exceeds the configured maximum before any
//! payload byte is buffered.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::{HEADER_SIZE, MAX_PACKET_SIZE};
use crate::core::packet::{Packet, PacketHeader};
use crate::error::{ProtocolError, Result};
use crate::utils::buffer_pool::BufferPool;

/// Framing codec for `Framed` transports
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_packet_size: usize,
}

impl PacketCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(MAX_PACKET_SIZE)
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        let size = item.payload().len();
        if size > self.max_packet_size {
            return Err(ProtocolError::PacketTooLarge {
                size,
                max: self.max_packet_size,
            });
        }

        item.encode_into(dst);
        Ok(())
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = PacketHeader::parse(&src[..HEADER_SIZE])?;
        header.check_prefix(self.max_packet_size)?;

        let total = HEADER_SIZE + header.length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total).freeze();
        Packet::from_parts(header, frame.slice(HEADER_SIZE..)).map(Some)
    }
}

/// Read one packet from `reader`.
///
/// EOF before the first header byte is a clean close and yields
/// `ConnectionClosed`; EOF anywhere later yields `ShortRead`. Payloads small enough
/// to be pooled are read into scratch from `scratch` and copied out, larger ones
/// are read into a fresh allocation that is handed over directly.
pub async fn read_packet<R>(
    reader: &mut R,
    scratch: &BufferPool,
    max_packet_size: usize,
) -> Result<Packet>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut head = [0u8; HEADER_SIZE];
    let filled = fill(reader, &mut head).await?;
    if filled == 0 {
        return Err(ProtocolError::ConnectionClosed);
    }
    if filled < HEADER_SIZE {
        return Err(ProtocolError::ShortRead {
            expected: HEADER_SIZE,
            actual: filled,
        });
    }

    let header = PacketHeader::parse(&head)?;
    header.check_prefix(max_packet_size)?;

    let len = header.length as usize;
    let payload = if len == 0 {
        Bytes::new()
    } else if scratch.retains(len) {
        let mut buf = scratch.acquire(len);
        read_payload(reader, &mut buf).await?;
        Bytes::copy_from_slice(&buf)
    } else {
        let mut buf = vec![0u8; len];
        read_payload(reader, &mut buf).await?;
        Bytes::from(buf)
    };

    Packet::from_parts(header, payload)
}

async fn read_payload<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let filled = fill(reader, buf).await?;
    if filled < buf.len() {
        return Err(ProtocolError::ShortRead {
            expected: buf.len(),
            actual: filled,
        });
    }
    Ok(())
}

/// Read until `buf` is full or EOF, returning the number of bytes read.
async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::error::PacketFault;

    fn pool() -> BufferPool {
        BufferPool::new(2, 1024)
    }

    #[tokio::test]
    async fn test_read_packet_roundtrip() {
        let packet = Packet::new(5, b"ping".to_vec(), 1);
        let bytes = packet.to_bytes();
        let mut reader = &bytes[..];

        let decoded = read_packet(&mut reader, &pool(), MAX_PACKET_SIZE)
            .await
            .unwrap();
        assert_eq!(decoded, packet);
    }

    #[tokio::test]
    async fn test_read_packet_large_payload_bypasses_pool() {
        let scratch = BufferPool::new(1, 16);
        let packet = Packet::new(5, vec![7u8; 4096], 2);
        let bytes = packet.to_bytes();
        let mut reader = &bytes[..];

        let decoded = read_packet(&mut reader, &scratch, MAX_PACKET_SIZE)
            .await
            .unwrap();
        assert_eq!(decoded.payload().len(), 4096);
        assert_eq!(scratch.available(), 1);
    }

    #[tokio::test]
    async fn test_returned_payload_outlives_scratch_reuse() {
        let scratch = pool();
        let bytes = [
            Packet::new(1, b"first".to_vec(), 1).to_bytes(),
            Packet::new(1, b"other".to_vec(), 2).to_bytes(),
        ]
        .concat();
        let mut reader = &bytes[..];

        let first = read_packet(&mut reader, &scratch, MAX_PACKET_SIZE)
            .await
            .unwrap();
        let second = read_packet(&mut reader, &scratch, MAX_PACKET_SIZE)
            .await
            .unwrap();
        assert_eq!(&first.payload()[..], b"first");
        assert_eq!(&second.payload()[..], b"other");
    }

    #[tokio::test]
    async fn test_clean_eof_is_connection_closed() {
        let mut reader: &[u8] = &[];
        let err = read_packet(&mut reader, &pool(), MAX_PACKET_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_short_read() {
        let bytes = Packet::new(1, b"truncated".to_vec(), 1).to_bytes();
        let mut reader = &bytes[..bytes.len() - 3];
        let err = read_packet(&mut reader, &pool(), MAX_PACKET_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ShortRead {
                expected: 9,
                actual: 6
            }
        ));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected_before_payload() {
        let mut bytes = Packet::new(1, b"x".to_vec(), 1).to_bytes();
        bytes[7..11].copy_from_slice(&(64u32).to_be_bytes());
        // no payload bytes behind the header at all
        let mut reader = &bytes[..HEADER_SIZE];
        let err = read_packet(&mut reader, &pool(), 32).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::PacketTooLarge { size: 64, max: 32 }
        ));
    }

    #[tokio::test]
    async fn test_bad_version_rejected() {
        let mut bytes = Packet::new(1, b"v".to_vec(), 1).to_bytes();
        bytes[4] = 9;
        let mut reader = &bytes[..];
        let err = read_packet(&mut reader, &pool(), MAX_PACKET_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidPacket(PacketFault::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_codec_waits_for_full_frame() {
        let mut codec = PacketCodec::default();
        let bytes = Packet::new(3, b"split".to_vec(), 4).to_bytes();

        let mut buf = BytesMut::from(&bytes[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 10);

        buf.extend_from_slice(&bytes[10..]);
        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&packet.payload()[..], b"split");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_rejects_oversized_encode() {
        let mut codec = PacketCodec::new(4);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Packet::new(1, b"too long".to_vec(), 1), &mut buf)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::PacketTooLarge { size: 8, max: 4 }));
        assert!(buf.is_empty());
    }
}
