//! Murmur Protocol -- wire types, tuning parameters, frame codec, API framing.
//!
//! Encrypted TCP between peers: u16 big-endian length prefix + AEAD
//! ciphertext of a serde JSON message union. Plain TCP for local API
//! clients with a fixed binary header.

pub mod api;
pub mod codec;
pub mod messages;
pub mod params;

pub use codec::FrameCodec;
pub use messages::*;
pub use params::{ProtocolParams, PARAMS};

/// Gossip data type identifier carried by every rumor.
pub type DataType = u16;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("frame too short: {size} bytes (min {min})")]
    FrameTooShort { size: usize, min: usize },
    #[error("truncated api payload for type {msg_type}: {got} bytes")]
    TruncatedApiPayload { msg_type: u16, got: usize },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
