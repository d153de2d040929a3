//! Established secure sessions: encrypted, framed, split into halves.

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use murmur_crypto::{session, CryptoError, Opener, Sealer};
use murmur_protocol::{FrameCodec, PeerMessage, ProtocolError};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection closed by peer")]
    Closed,
    #[error("frame error: {0}")]
    Frame(#[from] ProtocolError),
    #[error("record error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A handshaked peer connection. Split it to hand the halves to the
/// reader and writer tasks.
pub struct SecureConnection {
    reader: SecureReader,
    writer: SecureWriter,
    remote_identity: String,
}

impl std::fmt::Debug for SecureConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureConnection")
            .field("remote_identity", &self.remote_identity)
            .finish_non_exhaustive()
    }
}

/// Receiving half: decrypts and decodes inbound frames.
pub struct SecureReader {
    stream: SplitStream<Framed<TcpStream, FrameCodec>>,
    opener: Opener,
}

/// Sending half: encodes and encrypts outbound messages.
pub struct SecureWriter {
    sink: SplitSink<Framed<TcpStream, FrameCodec>, Bytes>,
    sealer: Sealer,
}

impl SecureConnection {
    pub(crate) fn new(
        framed: Framed<TcpStream, FrameCodec>,
        key: &[u8; session::SESSION_KEY_LEN],
        is_client: bool,
        remote_identity: String,
    ) -> Result<Self, CryptoError> {
        let (sealer, opener) = session::session_pair(key, is_client)?;
        let (sink, stream) = framed.split();
        Ok(Self {
            reader: SecureReader { stream, opener },
            writer: SecureWriter { sink, sealer },
            remote_identity,
        })
    }

    /// Hex identity of the authenticated remote peer.
    pub fn remote_identity(&self) -> &str {
        &self.remote_identity
    }

    pub fn split(self) -> (SecureReader, SecureWriter) {
        (self.reader, self.writer)
    }
}

impl SecureReader {
    /// Receive and decrypt the next message. `Err(SessionError::Closed)`
    /// on orderly end of stream.
    pub async fn recv(&mut self) -> Result<PeerMessage, SessionError> {
        let frame = self
            .stream
            .next()
            .await
            .ok_or(SessionError::Closed)??;
        let plaintext = self.opener.open(&frame)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

impl SecureWriter {
    /// Encrypt and send one message.
    pub async fn send(&mut self, msg: &PeerMessage) -> Result<(), SessionError> {
        let plaintext = serde_json::to_vec(msg)?;
        let ciphertext = self.sealer.seal(&plaintext)?;
        self.sink.send(Bytes::from(ciphertext)).await?;
        Ok(())
    }

    /// Flush and close the underlying socket write half.
    pub async fn shutdown(&mut self) {
        let _ = self.sink.close().await;
    }
}
