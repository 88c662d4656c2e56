//! Framing for the development relay.
//!
//! ## Wire format
//!
//! ```text
//! magic:     [u8; 4]  "CSL1"
//! kind:      u8       message discriminant, checked after decoding
//! length:    u32 LE   body length in bytes
//! checksum:  u32 LE   first 4 bytes of blake3(body)
//! body:      bincode-encoded RelayMessage
//! ```

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::encoder::EncodedUnit;
use crate::error::StreamError;

pub const MAGIC: [u8; 4] = *b"CSL1";
pub const HEADER_LEN: usize = 13;
/// Largest body the codec will accept. A 4K intra frame fits easily.
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

// ── Messages ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Publish = 1,
    PublishAccepted = 2,
    PublishRejected = 3,
    Media = 4,
    Ping = 5,
    Pong = 6,
    Close = 7,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayMessage {
    Publish { key: String },
    PublishAccepted,
    PublishRejected { reason: String },
    Media { unit: EncodedUnit },
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    Close,
}

impl RelayMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Publish { .. } => MessageKind::Publish,
            Self::PublishAccepted => MessageKind::PublishAccepted,
            Self::PublishRejected { .. } => MessageKind::PublishRejected,
            Self::Media { .. } => MessageKind::Media,
            Self::Ping { .. } => MessageKind::Ping,
            Self::Pong { .. } => MessageKind::Pong,
            Self::Close => MessageKind::Close,
        }
    }
}

fn checksum(body: &[u8]) -> u32 {
    let hash = blake3::hash(body);
    let b = hash.as_bytes();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

// ── Codec ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RelayCodec {
    max_body: usize,
}

impl RelayCodec {
    pub fn new() -> Self {
        Self {
            max_body: MAX_BODY_LEN,
        }
    }

    pub fn with_max_body(max_body: usize) -> Self {
        Self { max_body }
    }
}

impl Default for RelayCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RelayCodec {
    type Item = RelayMessage;
    type Error = StreamError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        if src[0..4] != MAGIC {
            return Err(StreamError::InvalidMagic);
        }
        let kind = src[4];
        let len = u32::from_le_bytes([src[5], src[6], src[7], src[8]]) as usize;
        if len > self.max_body {
            return Err(StreamError::FrameTooLarge {
                size: len,
                max: self.max_body,
            });
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let expected = u32::from_le_bytes([src[9], src[10], src[11], src[12]]);
        src.advance(HEADER_LEN);
        let body = src.split_to(len);
        if checksum(&body) != expected {
            return Err(StreamError::ChecksumMismatch);
        }

        let message: RelayMessage = bincode::deserialize(&body)?;
        if message.kind() as u8 != kind {
            return Err(StreamError::Encoding(format!(
                "header kind {kind} does not match {:?}",
                message.kind()
            )));
        }
        Ok(Some(message))
    }
}

impl Encoder<RelayMessage> for RelayCodec {
    type Error = StreamError;

    fn encode(&mut self, item: RelayMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = bincode::serialize(&item)?;
        if body.len() > self.max_body {
            return Err(StreamError::FrameTooLarge {
                size: body.len(),
                max: self.max_body,
            });
        }
        dst.reserve(HEADER_LEN + body.len());
        dst.put_slice(&MAGIC);
        dst.put_u8(item.kind() as u8);
        dst.put_u32_le(body.len() as u32);
        dst.put_u32_le(checksum(&body));
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn media() -> RelayMessage {
        RelayMessage::Media {
            unit: EncodedUnit {
                frame_number: 7,
                pts: Duration::from_millis(233),
                duration: Duration::from_millis(33),
                keyframe: true,
                width: 1280,
                height: 720,
                data: Bytes::from(vec![0xAB; 4096]),
            },
        }
    }

    fn encoded(msg: RelayMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        RelayCodec::new().encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn header_layout() {
        let buf = encoded(RelayMessage::Ping { nonce: 9 });
        assert_eq!(&buf[0..4], b"CSL1");
        assert_eq!(buf[4], MessageKind::Ping as u8);
        let len = u32::from_le_bytes(buf[5..9].try_into().unwrap()) as usize;
        assert_eq!(buf.len(), HEADER_LEN + len);
    }

    #[test]
    fn partial_input_waits_for_more() {
        let full = encoded(media());
        let mut codec = RelayCodec::new();

        let mut partial = BytesMut::from(&full[..HEADER_LEN + 10]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);

        partial.extend_from_slice(&full[HEADER_LEN + 10..]);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(media()));
        assert!(partial.is_empty());
    }

    #[test]
    fn back_to_back_frames() {
        let mut buf = encoded(RelayMessage::Publish { key: "k".into() });
        buf.extend_from_slice(&encoded(RelayMessage::Close));
        let mut codec = RelayCodec::new();
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(RelayMessage::Publish { .. })
        ));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(RelayMessage::Close));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = encoded(RelayMessage::Close);
        buf[0] = b'X';
        assert!(matches!(
            RelayCodec::new().decode(&mut buf),
            Err(StreamError::InvalidMagic)
        ));
    }

    #[test]
    fn corrupted_body_fails_checksum() {
        let mut buf = encoded(media());
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        assert!(matches!(
            RelayCodec::new().decode(&mut buf),
            Err(StreamError::ChecksumMismatch)
        ));
    }

    #[test]
    fn oversized_frames_are_refused_both_ways() {
        let mut small = RelayCodec::with_max_body(64);
        let mut dst = BytesMut::new();
        assert!(matches!(
            small.encode(media(), &mut dst),
            Err(StreamError::FrameTooLarge { max: 64, .. })
        ));

        let mut buf = encoded(media());
        assert!(matches!(
            small.decode(&mut buf),
            Err(StreamError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn mismatched_kind_is_an_encoding_error() {
        let mut buf = encoded(RelayMessage::Ping { nonce: 1 });
        buf[4] = MessageKind::Pong as u8;
        assert!(matches!(
            RelayCodec::new().decode(&mut buf),
            Err(StreamError::Encoding(_))
        ));
    }
}
