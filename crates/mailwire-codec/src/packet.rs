//! Length-prefixed packet codec.
//!
//! Wire layout: `[4-byte big-endian length][1-byte command][length - 1 payload bytes]`.
//! The length counts the command byte, so the smallest valid packet has a
//! length of 1.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{DEFAULT_MAX_PACKET_SIZE, DecodeError};

/// Size of the length prefix.
const HEADER_LEN: usize = 4;

/// A decoded length-prefixed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Command byte.
    pub command: u8,
    /// Payload following the command byte.
    pub payload: Bytes,
}

impl Packet {
    /// Creates a packet.
    #[must_use]
    pub fn new(command: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }

    /// Creates a packet with no payload.
    #[must_use]
    pub const fn bare(command: u8) -> Self {
        Self {
            command,
            payload: Bytes::new(),
        }
    }

    /// Returns the wire length value (command byte plus payload).
    #[must_use]
    pub fn wire_len(&self) -> usize {
        self.payload.len() + 1
    }
}

/// Codec for length-prefixed packets.
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_packet_size: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl PacketCodec {
    /// Creates a codec that rejects packets longer than `max_packet_size`.
    #[must_use]
    pub const fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }

    /// Returns the configured maximum packet size.
    #[must_use]
    pub const fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, DecodeError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Peek at the length; nothing is consumed until the whole packet is here.
        let declared = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if declared < 1 {
            return Err(DecodeError::InvalidPacketLength(declared));
        }
        let len = usize::try_from(declared).map_err(|_| DecodeError::InvalidPacketLength(declared))?;
        if len > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge {
                size: len,
                limit: self.max_packet_size,
            });
        }

        let total = HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let command = src.get_u8();
        let payload = src.split_to(len - 1).freeze();
        Ok(Some(Packet { command, payload }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = DecodeError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), DecodeError> {
        let len = packet.wire_len();
        let declared = u32::try_from(len).map_err(|_| DecodeError::PacketTooLarge {
            size: len,
            limit: self.max_packet_size,
        })?;
        dst.reserve(HEADER_LEN + len);
        dst.put_u32(declared);
        dst.put_u8(packet.command);
        dst.put_slice(&packet.payload);
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_complete_packet() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::from(&[0, 0, 0, 3, b'R', b'a', 0][..]);
        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.command, b'R');
        assert_eq!(&packet.payload[..], b"a\0");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_short_header_consumes_nothing() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::from(&[0, 0, 0][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_short_body_consumes_nothing() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::from(&[0, 0, 0, 5, b'D', b'M'][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn test_bare_command() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::from(&[0, 0, 0, 1, b'Q', 0, 0][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Packet::bare(b'Q')));
        assert_eq!(&buf[..], &[0, 0]);
    }

    #[test]
    fn test_zero_and_negative_lengths_rejected() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::from(&[0, 0, 0, 0, b'Q'][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(DecodeError::InvalidPacketLength(0))
        ));
        let mut buf = BytesMut::from(&[0xff, 0xff, 0xff, 0xff][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(DecodeError::InvalidPacketLength(-1))
        ));
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let mut codec = PacketCodec::new(16);
        let mut buf = BytesMut::from(&[0, 0, 0, 17][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, DecodeError::PacketTooLarge { size: 17, limit: 16 }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_encode_layout() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Packet::new(b'y', &b"554 no\0"[..]), &mut buf).unwrap();
        assert_eq!(&buf[..4], &8u32.to_be_bytes());
        assert_eq!(buf[4], b'y');
        assert_eq!(&buf[5..], b"554 no\0");
    }
}
