//! Wire message types exchanged between peers.
//!
//! One tagged union for the encrypted data phase plus the plaintext
//! handshake record. Binary fields travel as base64 strings inside the
//! JSON encoding.

use serde::{Deserialize, Serialize};

use crate::DataType;

/// A rumor supplied by a local client and spread through the network.
/// Two items are equal iff both the data type and the payload match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GossipItem {
    pub data_type: DataType,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Median-counter dissemination state as it appears on the wire.
/// State A is represented by absence and state D never leaves a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RumorState {
    B,
    C,
}

/// An item together with its dissemination progress, the unit of both
/// gossip pushes and pull replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RumorUpdate {
    pub item: GossipItem,
    pub state: RumorState,
    pub counter: u8,
}

impl RumorUpdate {
    /// Ordering over (state, counter): C beats B, then higher counter.
    pub fn rank(&self) -> u16 {
        ((self.state as u16) << 8) | self.counter as u16
    }
}

/// A membership limited-push request. `from` and `to` are P2P listen
/// addresses; the nonce satisfies the admission puzzle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub from: String,
    pub to: String,
    pub time_utc: i64,
    pub nonce: u64,
}

impl PushRequest {
    /// Canonical byte string the admission puzzle is computed over.
    pub fn puzzle_input(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.from.len() + self.to.len() + 16);
        buf.extend_from_slice(self.from.as_bytes());
        buf.extend_from_slice(self.to.as_bytes());
        buf.extend_from_slice(&self.time_utc.to_be_bytes());
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf
    }
}

/// The encrypted data-phase union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerMessage {
    MembershipPush(PushRequest),
    MembershipPullRequest,
    MembershipPullReply { view: Vec<String> },
    GossipPush(RumorUpdate),
    GossipPullRequest,
    GossipPullReply { items: Vec<RumorUpdate> },
}

/// The plaintext handshake record, exchanged exactly once per connection
/// before any encrypted frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRecord {
    /// Ephemeral Diffie-Hellman public value (256 bytes, group 14).
    #[serde(with = "base64_bytes")]
    pub dh_pub: Vec<u8>,
    /// RSA public key, PKCS#1 DER (512 bytes for a 4096-bit key).
    #[serde(with = "base64_bytes")]
    pub rsa_pub: Vec<u8>,
    /// Creation time, UTC seconds.
    pub time_utc: i64,
    /// Advertised P2P listen address of the sender.
    pub addr: String,
    /// Admission puzzle nonce (64 bytes).
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    /// RSA-PSS signature over SHA3-256(puzzle_input || nonce).
    #[serde(with = "base64_bytes")]
    pub sig: Vec<u8>,
    /// True on the dialing side.
    pub is_client: bool,
}

impl HandshakeRecord {
    /// Canonical byte string the admission puzzle is computed over
    /// (the nonce is appended by the puzzle as both suffix and salt).
    pub fn puzzle_input(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(self.dh_pub.len() + self.rsa_pub.len() + 8 + self.addr.len());
        buf.extend_from_slice(&self.dh_pub);
        buf.extend_from_slice(&self.rsa_pub);
        buf.extend_from_slice(&self.time_utc.to_be_bytes());
        buf.extend_from_slice(self.addr.as_bytes());
        buf
    }

    /// Structural sanity: every required field present with its declared
    /// length. The malformed-record reject predicate.
    pub fn is_well_formed(&self) -> bool {
        self.dh_pub.len() == 256
            && !self.rsa_pub.is_empty()
            && self.rsa_pub.len() <= 600
            && self.nonce.len() == 64
            && !self.sig.is_empty()
            && self.sig.len() <= 600
            && !self.addr.is_empty()
            && self.addr.len() <= 64
    }
}

/// Serialize/deserialize Vec<u8> as a base64 string.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
