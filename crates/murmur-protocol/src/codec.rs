//! Length-delimited frame codec for peer connections.
//!
//! Wire format: 2-byte big-endian length prefix + payload. The payload
//! stays opaque here; the transport layer encrypts and decrypts it
//! around this codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::ProtocolError;

/// Length prefix size in bytes.
const LENGTH_PREFIX_SIZE: usize = 2;

/// Codec for framing opaque payloads over a byte stream.
pub struct FrameCodec {
    max_frame: usize,
}

impl FrameCodec {
    /// `max_frame` is the per-frame payload budget; anything larger is a
    /// protocol violation that tears the connection down.
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u16::from_be_bytes([src[0], src[1]]) as usize;
        if length > self.max_frame {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame,
            });
        }

        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame || item.len() > u16::MAX as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: item.len(),
                max: self.max_frame.min(u16::MAX as usize),
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + item.len());
        dst.put_u16(item.len() as u16);
        dst.extend_from_slice(&item);
        Ok(())
    }
}
