//! RSA host identity -- keypair loading, provisioning, and the RSA-PSS
//! signatures used by the handshake.

use rsa::pkcs1::{
    DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey,
};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, LineEnding};
use rsa::pss::{BlindedSigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha3::Sha3_256;
use std::path::Path;

use crate::{identity_hex, CryptoError};

/// Key size for provisioned host keys.
pub const HOST_KEY_BITS: usize = 4096;

/// The node's long-lived RSA identity.
pub struct HostIdentity {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    public_der: Vec<u8>,
}

impl HostIdentity {
    /// Load the keypair from its PEM files. The private key may be
    /// PKCS#1 or PKCS#8; the public key may be PKCS#1 or SPKI.
    pub fn load(hostkey_path: &Path, pubkey_path: &Path) -> Result<Self, CryptoError> {
        let priv_pem = std::fs::read_to_string(hostkey_path)?;
        let private = RsaPrivateKey::from_pkcs1_pem(&priv_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(&priv_pem))
            .map_err(|e| CryptoError::Key(format!("hostkey: {e}")))?;

        let pub_pem = std::fs::read_to_string(pubkey_path)?;
        let public = RsaPublicKey::from_pkcs1_pem(&pub_pem)
            .or_else(|_| RsaPublicKey::from_public_key_pem(&pub_pem))
            .map_err(|e| CryptoError::Key(format!("pubkey: {e}")))?;

        Self::from_parts(private, public)
    }

    /// Generate a fresh keypair (key provisioning).
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| CryptoError::Key(format!("keygen: {e}")))?;
        let public = private.to_public_key();
        Self::from_parts(private, public)
    }

    fn from_parts(private: RsaPrivateKey, public: RsaPublicKey) -> Result<Self, CryptoError> {
        let public_der = public
            .to_pkcs1_der()
            .map_err(|e| CryptoError::Key(format!("pubkey der: {e}")))?
            .into_vec();
        Ok(Self {
            private,
            public,
            public_der,
        })
    }

    /// Write the keypair as a PKCS#1 PEM pair.
    pub fn write_pem(&self, hostkey_path: &Path, pubkey_path: &Path) -> Result<(), CryptoError> {
        let priv_pem = self
            .private
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Key(format!("hostkey pem: {e}")))?;
        let pub_pem = self
            .public
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Key(format!("pubkey pem: {e}")))?;
        if let Some(parent) = hostkey_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(hostkey_path, priv_pem.as_bytes())?;
        std::fs::write(pubkey_path, pub_pem.as_bytes())?;
        Ok(())
    }

    /// PKCS#1 DER encoding of the public key (the wire form).
    pub fn public_der(&self) -> &[u8] {
        &self.public_der
    }

    /// SHA-256 identity of this node's public key, lowercase hex.
    pub fn identity_hex(&self) -> String {
        identity_hex(&self.public_der)
    }

    /// RSA-PSS signature with SHA3-256 over `message`.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signing = BlindedSigningKey::<Sha3_256>::new(self.private.clone());
        signing
            .sign_with_rng(&mut rand::thread_rng(), message)
            .to_vec()
    }
}

/// Verify an RSA-PSS / SHA3-256 signature against a PKCS#1 DER public key.
pub fn verify_signature(
    rsa_pub_der: &[u8],
    message: &[u8],
    sig: &[u8],
) -> Result<(), CryptoError> {
    let public = RsaPublicKey::from_pkcs1_der(rsa_pub_der)
        .map_err(|e| CryptoError::Key(format!("peer pubkey: {e}")))?;
    let verifying = VerifyingKey::<Sha3_256>::new(public);
    let sig = rsa::pss::Signature::try_from(sig).map_err(|_| CryptoError::SignatureInvalid)?;
    verifying
        .verify(message, &sig)
        .map_err(|_| CryptoError::SignatureInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    // 4096-bit keygen is slow; tests provision smaller keys. The
    // signature and identity paths are key-size independent.
    fn test_identity() -> HostIdentity {
        HostIdentity::generate(2048).unwrap()
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let id = test_identity();
        let sig = id.sign(b"handshake bytes");
        verify_signature(id.public_der(), b"handshake bytes", &sig).unwrap();
    }

    #[test]
    fn test_verify_rejects_tampered_message() {
        let id = test_identity();
        let sig = id.sign(b"handshake bytes");
        assert!(verify_signature(id.public_der(), b"other bytes", &sig).is_err());
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let id = test_identity();
        let other = test_identity();
        let sig = id.sign(b"handshake bytes");
        assert!(verify_signature(other.public_der(), b"handshake bytes", &sig).is_err());
    }

    #[test]
    fn test_identity_is_stable_hex() {
        let id = test_identity();
        let a = id.identity_hex();
        assert_eq!(a.len(), 64);
        assert_eq!(a, identity_hex(id.public_der()));
    }

    #[test]
    fn test_pem_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("hostkey.pem");
        let pubk = dir.path().join("pubkey.pem");

        let id = test_identity();
        id.write_pem(&host, &pubk).unwrap();

        let loaded = HostIdentity::load(&host, &pubk).unwrap();
        assert_eq!(loaded.identity_hex(), id.identity_hex());

        let sig = loaded.sign(b"msg");
        verify_signature(id.public_der(), b"msg", &sig).unwrap();
    }
}
