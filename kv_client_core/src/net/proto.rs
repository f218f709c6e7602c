//! Proto framing
//!
//! Every request and response starts with an 8 byte big-endian word: the
//! protocol version in the top byte, the message type in the next byte and
//! the body length in the remaining 48 bits.

use crate::error::{ClientError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const PROTO_VERSION: u8 = 2;
pub const INFO_MESSAGE_TYPE: u8 = 1;
pub const ADMIN_MESSAGE_TYPE: u8 = 2;
pub const DATA_MESSAGE_TYPE: u8 = 3;
pub const HEADER_SIZE: usize = 8;

/// Upper bound on a single body, larger sizes indicate a desynchronized stream
pub const MAX_BODY_SIZE: usize = 128 * 1024 * 1024;

const SIZE_MASK: u64 = 0xFFFF_FFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoHeader {
    pub version: u8,
    pub msg_type: u8,
    pub size: usize,
}

impl ProtoHeader {
    pub fn new(msg_type: u8, size: usize) -> Self {
        Self {
            version: PROTO_VERSION,
            msg_type,
            size,
        }
    }

    pub fn encode(&self) -> u64 {
        (self.size as u64 & SIZE_MASK) | ((self.version as u64) << 56) | ((self.msg_type as u64) << 48)
    }

    /// Decode and check a received header
    pub fn decode(word: u64) -> Result<Self> {
        let header = Self {
            version: (word >> 56) as u8,
            msg_type: ((word >> 48) & 0xFF) as u8,
            size: (word & SIZE_MASK) as usize,
        };
        if header.version != PROTO_VERSION {
            return Err(ClientError::Parse(format!(
                "invalid proto version {}",
                header.version
            )));
        }
        if header.size > MAX_BODY_SIZE {
            return Err(ClientError::Parse(format!(
                "proto body size {} exceeds limit",
                header.size
            )));
        }
        Ok(header)
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Result<Self> {
        Self::decode(u64::from_be_bytes(*bytes))
    }
}

/// One framed message
#[derive(Debug, Clone)]
pub struct ProtoMessage {
    pub header: ProtoHeader,
    pub body: Bytes,
}

impl ProtoMessage {
    pub fn new(msg_type: u8, body: Bytes) -> Self {
        Self {
            header: ProtoHeader::new(msg_type, body.len()),
            body,
        }
    }

    /// Header and body as one buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.body.len());
        buf.put_u64(self.header.encode());
        buf.put_slice(&self.body);
        buf.freeze()
    }
}

/// Codec for framed transports
///
/// The encoder writes pre-framed request buffers unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProtoCodec;

impl Decoder for ProtoCodec {
    type Item = ProtoMessage;
    type Error = ClientError;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut word = [0u8; HEADER_SIZE];
        word.copy_from_slice(&src[..HEADER_SIZE]);
        let header = ProtoHeader::from_bytes(&word)?;

        let frame_len = HEADER_SIZE + header.size;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let body = src.split_to(header.size).freeze();
        Ok(Some(ProtoMessage { header, body }))
    }
}

impl Encoder<Bytes> for ProtoCodec {
    type Error = ClientError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = ProtoHeader::new(DATA_MESSAGE_TYPE, 300);
        let bytes = header.encode().to_be_bytes();
        assert_eq!(bytes[0], 2);
        assert_eq!(bytes[1], 3);
        assert_eq!(&bytes[2..], &[0, 0, 0, 0, 1, 44]);
        assert_eq!(ProtoHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let word = (7u64 << 56) | (1u64 << 48) | 10;
        assert!(matches!(ProtoHeader::decode(word), Err(ClientError::Parse(_))));
    }

    #[test]
    fn test_decoder_waits_for_full_frame() {
        let message = ProtoMessage::new(INFO_MESSAGE_TYPE, Bytes::from_static(b"node\tA1\n"));
        let frame = message.to_bytes();

        let mut codec = ProtoCodec;
        let mut src = BytesMut::from(&frame[..10]);
        assert!(codec.decode(&mut src).unwrap().is_none());

        src.extend_from_slice(&frame[10..]);
        src.extend_from_slice(&frame[..4]);
        let decoded = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(decoded.header.msg_type, INFO_MESSAGE_TYPE);
        assert_eq!(&decoded.body[..], b"node\tA1\n");
        assert_eq!(src.len(), 4);
    }
}
