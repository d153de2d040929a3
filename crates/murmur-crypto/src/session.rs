//! Session key derivation and the AES-256-GCM record cipher.
//!
//! The completed Diffie-Hellman secret is compressed with scrypt into a
//! 256-bit AES key, immutable for the lifetime of the connection. Each
//! direction owns a monotonically increasing sequence number that forms
//! the AEAD nonce together with a direction byte, so the two directions
//! can never collide under the shared key.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};

use crate::CryptoError;

/// Session key length in bytes.
pub const SESSION_KEY_LEN: usize = 32;

/// Domain separation salt for the session key compression.
const SESSION_SALT: &[u8] = b"murmur/session/v1";

const DIR_CLIENT: u8 = 0x01;
const DIR_SERVER: u8 = 0x02;

/// Compress a Diffie-Hellman shared secret into a 256-bit AES key.
pub fn derive_session_key(shared: &[u8]) -> Result<[u8; SESSION_KEY_LEN], CryptoError> {
    let params =
        scrypt::Params::new(14, 8, 1, SESSION_KEY_LEN).expect("session scrypt parameters");
    let mut key = [0u8; SESSION_KEY_LEN];
    scrypt::scrypt(shared, SESSION_SALT, &params, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

fn aead_key(key: &[u8; SESSION_KEY_LEN]) -> Result<LessSafeKey, CryptoError> {
    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| CryptoError::EncryptionFailed("invalid session key".into()))?;
    Ok(LessSafeKey::new(unbound))
}

fn nonce_for(direction: u8, seq: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[0] = direction;
    bytes[4..].copy_from_slice(&seq.to_be_bytes());
    Nonce::assume_unique_for_key(bytes)
}

/// Sealing half of a session: encrypts outgoing records.
pub struct Sealer {
    key: LessSafeKey,
    direction: u8,
    seq: u64,
}

/// Opening half of a session: decrypts incoming records.
pub struct Opener {
    key: LessSafeKey,
    direction: u8,
    seq: u64,
}

/// Build the sealer/opener pair for one side of a connection.
pub fn session_pair(
    key: &[u8; SESSION_KEY_LEN],
    is_client: bool,
) -> Result<(Sealer, Opener), CryptoError> {
    let (own, peer) = if is_client {
        (DIR_CLIENT, DIR_SERVER)
    } else {
        (DIR_SERVER, DIR_CLIENT)
    };
    Ok((
        Sealer {
            key: aead_key(key)?,
            direction: own,
            seq: 0,
        },
        Opener {
            key: aead_key(key)?,
            direction: peer,
            seq: 0,
        },
    ))
}

impl Sealer {
    /// Encrypt one record; the tag is appended to the ciphertext.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = nonce_for(self.direction, self.seq);
        self.seq += 1;
        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::EncryptionFailed("seal failed".into()))?;
        Ok(in_out)
    }
}

impl Opener {
    /// Decrypt one record produced by the peer's sealer.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = nonce_for(self.direction, self.seq);
        self.seq += 1;
        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        Ok(plaintext.to_vec())
    }
}
