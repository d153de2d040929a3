//! Local client wire format.
//!
//! Every frame: `size: u16` big-endian covering the whole frame
//! including itself, `type: u16` big-endian, then the payload. Frames
//! shorter than the 4-byte header are a protocol violation; unknown
//! types are surfaced so the endpoint can skip them and resync on the
//! next frame boundary.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{DataType, ProtocolError};

/// GOSSIP ANNOUNCE message type.
pub const API_ANNOUNCE: u16 = 500;
/// GOSSIP NOTIFY message type.
pub const API_NOTIFY: u16 = 501;
/// GOSSIP NOTIFICATION message type.
pub const API_NOTIFICATION: u16 = 502;
/// GOSSIP VALIDATION message type.
pub const API_VALIDATION: u16 = 503;

/// Minimum frame size: the header alone.
const HEADER_SIZE: usize = 4;

/// A parsed local API frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiMessage {
    Announce {
        ttl: u8,
        data_type: DataType,
        data: Vec<u8>,
    },
    Notify {
        data_type: DataType,
    },
    Notification {
        message_id: u16,
        data_type: DataType,
        data: Vec<u8>,
    },
    Validation {
        message_id: u16,
        valid: bool,
    },
    /// A frame with an unrecognized type. Skipped by the endpoint.
    Unknown {
        msg_type: u16,
    },
}

/// Codec for the local client protocol.
#[derive(Default)]
pub struct ApiCodec;

impl Decoder for ApiCodec {
    type Item = ApiMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let size = u16::from_be_bytes([src[0], src[1]]) as usize;
        if size < HEADER_SIZE {
            return Err(ProtocolError::FrameTooShort {
                size,
                min: HEADER_SIZE,
            });
        }
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(size);
        frame.advance(2); // size already read
        let msg_type = frame.get_u16();
        let payload = frame;

        Ok(Some(parse_payload(msg_type, &payload)?))
    }
}

fn parse_payload(msg_type: u16, payload: &[u8]) -> Result<ApiMessage, ProtocolError> {
    let short = || ProtocolError::TruncatedApiPayload {
        msg_type,
        got: payload.len(),
    };
    match msg_type {
        API_ANNOUNCE => {
            // ttl u8, reserved u8, data_type u16, data
            if payload.len() < 4 {
                return Err(short());
            }
            Ok(ApiMessage::Announce {
                ttl: payload[0],
                data_type: u16::from_be_bytes([payload[2], payload[3]]),
                data: payload[4..].to_vec(),
            })
        }
        API_NOTIFY => {
            // reserved u16, data_type u16
            if payload.len() < 4 {
                return Err(short());
            }
            Ok(ApiMessage::Notify {
                data_type: u16::from_be_bytes([payload[2], payload[3]]),
            })
        }
        API_NOTIFICATION => {
            // message_id u16, data_type u16, data
            if payload.len() < 4 {
                return Err(short());
            }
            Ok(ApiMessage::Notification {
                message_id: u16::from_be_bytes([payload[0], payload[1]]),
                data_type: u16::from_be_bytes([payload[2], payload[3]]),
                data: payload[4..].to_vec(),
            })
        }
        API_VALIDATION => {
            // message_id u16, reserved u16 with bit 0 = valid
            if payload.len() < 4 {
                return Err(short());
            }
            Ok(ApiMessage::Validation {
                message_id: u16::from_be_bytes([payload[0], payload[1]]),
                valid: payload[3] & 1 != 0,
            })
        }
        other => Ok(ApiMessage::Unknown { msg_type: other }),
    }
}

impl Encoder<ApiMessage> for ApiCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: ApiMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (msg_type, body): (u16, Vec<u8>) = match item {
            ApiMessage::Announce {
                ttl,
                data_type,
                data,
            } => {
                let mut b = Vec::with_capacity(4 + data.len());
                b.push(ttl);
                b.push(0); // reserved
                b.extend_from_slice(&data_type.to_be_bytes());
                b.extend_from_slice(&data);
                (API_ANNOUNCE, b)
            }
            ApiMessage::Notify { data_type } => {
                let mut b = Vec::with_capacity(4);
                b.extend_from_slice(&0u16.to_be_bytes()); // reserved
                b.extend_from_slice(&data_type.to_be_bytes());
                (API_NOTIFY, b)
            }
            ApiMessage::Notification {
                message_id,
                data_type,
                data,
            } => {
                let mut b = Vec::with_capacity(4 + data.len());
                b.extend_from_slice(&message_id.to_be_bytes());
                b.extend_from_slice(&data_type.to_be_bytes());
                b.extend_from_slice(&data);
                (API_NOTIFICATION, b)
            }
            ApiMessage::Validation { message_id, valid } => {
                let mut b = Vec::with_capacity(4);
                b.extend_from_slice(&message_id.to_be_bytes());
                b.extend_from_slice(&[0, valid as u8]);
                (API_VALIDATION, b)
            }
            ApiMessage::Unknown { msg_type } => (msg_type, Vec::new()),
        };

        let size = HEADER_SIZE + body.len();
        if size > u16::MAX as usize {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: u16::MAX as usize,
            });
        }

        dst.reserve(size);
        dst.put_u16(size as u16);
        dst.put_u16(msg_type);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: ApiMessage) -> ApiMessage {
        let mut codec = ApiCodec;
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_announce_roundtrip() {
        let msg = ApiMessage::Announce {
            ttl: 3,
            data_type: 7,
            data: b"hi".to_vec(),
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_notify_roundtrip() {
        let msg = ApiMessage::Notify { data_type: 7 };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_notification_roundtrip() {
        let msg = ApiMessage::Notification {
            message_id: 0,
            data_type: 7,
            data: b"hi".to_vec(),
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_validation_bit_zero() {
        match roundtrip(ApiMessage::Validation {
            message_id: 4,
            valid: false,
        }) {
            ApiMessage::Validation { message_id, valid } => {
                assert_eq!(message_id, 4);
                assert!(!valid);
            }
            other => panic!("wrong variant: {other:?}"),
        }
        match roundtrip(ApiMessage::Validation {
            message_id: 4,
            valid: true,
        }) {
            ApiMessage::Validation { valid, .. } => assert!(valid),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_announce_wire_layout() {
        // size(2) type(2) ttl(1) reserved(1) data_type(2) data
        let mut codec = ApiCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                ApiMessage::Announce {
                    ttl: 3,
                    data_type: 7,
                    data: b"hi".to_vec(),
                },
                &mut buf,
            )
            .unwrap();
        assert_eq!(
            &buf[..],
            &[0, 10, 0x01, 0xF4, 3, 0, 0, 7, b'h', b'i'][..]
        );
    }

    #[test]
    fn test_undersized_frame_is_violation() {
        let mut codec = ApiCodec;
        let mut buf = BytesMut::new();
        buf.put_u16(3); // size below the header size
        buf.put_u16(500);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_unknown_type_is_skippable() {
        let mut codec = ApiCodec;
        let mut buf = BytesMut::new();
        buf.put_u16(6);
        buf.put_u16(999);
        buf.put_u16(0xABCD);
        match codec.decode(&mut buf).unwrap().unwrap() {
            ApiMessage::Unknown { msg_type } => assert_eq!(msg_type, 999),
            other => panic!("wrong variant: {other:?}"),
        }
        // The frame was fully consumed: a following frame still parses.
        codec
            .encode(ApiMessage::Notify { data_type: 1 }, &mut buf)
            .unwrap();
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            ApiMessage::Notify { data_type: 1 }
        );
    }

    #[test]
    fn test_partial_header() {
        let mut codec = ApiCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
