//! Murmur Crypto -- RSA host identity, ephemeral Diffie-Hellman, scrypt
//! admission puzzle, AES-256-GCM session cipher, trust directory.

use sha2::{Digest, Sha256};

pub mod dh;
pub mod identity;
pub mod puzzle;
pub mod session;
pub mod trust;

pub use dh::DhKeypair;
pub use identity::HostIdentity;
pub use puzzle::PuzzleParams;
pub use session::{derive_session_key, Opener, Sealer};
pub use trust::TrustStore;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("key error: {0}")]
    Key(String),
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("decryption failed: authentication tag mismatch")]
    DecryptionFailed,
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("diffie-hellman public value out of range")]
    DhPublicOutOfRange,
    #[error("no admissible nonce found within the retry budget")]
    PuzzleExhausted,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Peer identity: SHA-256 of the PKCS#1 DER encoding of its RSA public
/// key, as lowercase hex. This is the trust-directory file name.
pub fn identity_hex(rsa_pub_der: &[u8]) -> String {
    hex::encode(Sha256::digest(rsa_pub_der))
}
