//! Trust directory -- a filesystem set of pre-approved peer identities.
//!
//! An identity is trusted iff a file named with its 64-lowercase-hex
//! SHA-256 digest exists in the directory. File contents are ignored.
//! Lookups hit the filesystem every time; trust changes made while the
//! node runs take effect on the next handshake.

use std::path::{Path, PathBuf};

use crate::{identity_hex, CryptoError};

/// Handle to the trust directory.
#[derive(Debug, Clone)]
pub struct TrustStore {
    dir: PathBuf,
}

impl TrustStore {
    /// Open the trust directory, verifying it exists and is a directory.
    pub fn open(dir: &Path) -> Result<Self, CryptoError> {
        let meta = std::fs::metadata(dir)?;
        if !meta.is_dir() {
            return Err(CryptoError::Key(format!(
                "trusted identities path is not a directory: {}",
                dir.display()
            )));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// True iff the given hex identity has an entry.
    pub fn is_trusted(&self, identity: &str) -> bool {
        if identity.len() != 64
            || !identity
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return false;
        }
        self.dir.join(identity).is_file()
    }

    /// True iff the identity of the given PKCS#1 DER public key is trusted.
    pub fn trusts_key(&self, rsa_pub_der: &[u8]) -> bool {
        self.is_trusted(&identity_hex(rsa_pub_der))
    }

    /// Provision an identity entry (an empty file named by the digest).
    pub fn add(&self, identity: &str) -> Result<(), CryptoError> {
        std::fs::write(self.dir.join(identity), [])?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_rejects_missing_dir() {
        assert!(TrustStore::open(Path::new("/nonexistent/murmur-trust")).is_err());
    }

    #[test]
    fn test_open_rejects_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        assert!(TrustStore::open(&file).is_err());
    }

    #[test]
    fn test_trust_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path()).unwrap();

        let id = identity_hex(b"peer key");
        assert!(!store.is_trusted(&id));
        store.add(&id).unwrap();
        assert!(store.is_trusted(&id));
        assert!(store.trusts_key(b"peer key"));
        assert!(!store.trusts_key(b"other key"));
    }

    #[test]
    fn test_malformed_names_never_trusted() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path()).unwrap();
        // Even if such files exist, non-identity names are not identities.
        std::fs::write(dir.path().join("README"), b"").unwrap();
        assert!(!store.is_trusted("README"));
        assert!(!store.is_trusted("ZZ"));
        let upper = identity_hex(b"x").to_uppercase();
        assert!(!store.is_trusted(&upper));
    }

    #[test]
    fn test_lookup_is_uncached() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path()).unwrap();
        let id = identity_hex(b"revocable");
        store.add(&id).unwrap();
        assert!(store.is_trusted(&id));
        std::fs::remove_file(dir.path().join(&id)).unwrap();
        assert!(!store.is_trusted(&id), "revocation must take effect immediately");
    }
}
