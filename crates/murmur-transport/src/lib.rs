//! Murmur Transport -- mutually authenticated, encrypted, length-bounded
//! point-to-point channel between nodes.
//!
//! A connection is plain TCP carrying u16-length-prefixed frames. The
//! first frame in each direction is the plaintext handshake record;
//! every later frame is AES-256-GCM ciphertext under the session key
//! derived from the completed Diffie-Hellman exchange. The handshake
//! runs exactly once per connection and every failure closes the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use murmur_crypto::{HostIdentity, PuzzleParams, TrustStore};

pub mod handshake;
pub mod session;

pub use session::{SecureConnection, SecureReader, SecureWriter, SessionError};

/// Everything a handshake needs besides the socket.
#[derive(Clone)]
pub struct TransportConfig {
    /// Long-lived RSA identity of this node.
    pub identity: Arc<HostIdentity>,
    /// Pre-provisioned trusted identities.
    pub trust: TrustStore,
    /// Our advertised P2P listen address.
    pub local_addr: SocketAddr,
    /// Admission puzzle cost and acceptance parameters.
    pub puzzle: PuzzleParams,
    /// Freshness window for handshake records.
    pub validity_window: Duration,
    /// Deadline for the whole handshake (puzzle included).
    pub handshake_timeout: Duration,
    /// Deadline for the TCP dial.
    pub dial_timeout: Duration,
    /// Per-frame payload budget.
    pub max_frame: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    Timeout,
    #[error("peer identity is not trusted")]
    UntrustedIdentity,
    #[error("admission puzzle rejected")]
    AdmissionRejected,
    #[error("handshake signature invalid")]
    SigInvalid,
    #[error("advertised address mismatch")]
    AddrMismatch,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Dial a peer and run the client side of the handshake.
pub async fn connect(
    addr: SocketAddr,
    config: &TransportConfig,
) -> Result<SecureConnection, HandshakeError> {
    let stream = tokio::time::timeout(config.dial_timeout, tokio::net::TcpStream::connect(addr))
        .await
        .map_err(|_| HandshakeError::Timeout)??;
    stream.set_nodelay(true)?;

    tokio::time::timeout(
        config.handshake_timeout,
        handshake::client_handshake(stream, addr, config),
    )
    .await
    .map_err(|_| HandshakeError::Timeout)?
}

/// Run the server side of the handshake on an accepted socket.
pub async fn accept(
    stream: tokio::net::TcpStream,
    config: &TransportConfig,
) -> Result<SecureConnection, HandshakeError> {
    stream.set_nodelay(true)?;
    tokio::time::timeout(
        config.handshake_timeout,
        handshake::server_handshake(stream, config),
    )
    .await
    .map_err(|_| HandshakeError::Timeout)?
}
