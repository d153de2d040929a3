//! Min-wise independent peer sampling.
//!
//! Each sampler draws a fresh secret AES-256 key and permutes the
//! SHA-256 digest of a peer's address by encrypting it in ECB mode (a
//! pseudorandom bijection over 256-bit values). The sampler keeps the
//! candidate with the smallest permuted image, which gives every peer
//! ever observed an equal chance of being the current sample and
//! defeats flooding of the view with adversarial addresses.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes256;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::bus::Peer;

/// A pseudorandom bijective 256-bit permutation with a secret key.
pub struct MinWisePermutation {
    cipher: Aes256,
}

impl MinWisePermutation {
    pub fn new() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self {
            cipher: Aes256::new(GenericArray::from_slice(&key)),
        }
    }

    /// Permuted image of the peer's address identity.
    pub fn permute(&self, peer: &Peer) -> [u8; 32] {
        let digest: [u8; 32] = Sha256::digest(peer.to_string().as_bytes()).into();
        let mut out = digest;
        for block in out.chunks_exact_mut(16) {
            self.cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        out
    }
}

impl Default for MinWisePermutation {
    fn default() -> Self {
        Self::new()
    }
}

/// One peer sampler: holds the candidate with the minimum permuted
/// image among everything it has been shown.
pub struct PeerSampler {
    permutation: MinWisePermutation,
    current: Option<(Peer, [u8; 32])>,
}

impl PeerSampler {
    pub fn new() -> Self {
        Self {
            permutation: MinWisePermutation::new(),
            current: None,
        }
    }

    /// Introduce a candidate. Returns true iff the current sample changed.
    pub fn next(&mut self, peer: Peer) -> bool {
        let image = self.permutation.permute(&peer);
        match &self.current {
            None => {
                self.current = Some((peer, image));
                true
            }
            Some((_, best)) if image < *best => {
                self.current = Some((peer, image));
                true
            }
            Some(_) => false,
        }
    }

    /// The current sample, if any candidate has been seen.
    pub fn sample(&self) -> Option<Peer> {
        self.current.map(|(peer, _)| peer)
    }

    /// Forget everything and draw a fresh permutation key. Used when the
    /// sampled peer turns out to be unreachable.
    pub fn reset(&mut self) {
        self.permutation = MinWisePermutation::new();
        self.current = None;
    }
}

impl Default for PeerSampler {
    fn default() -> Self {
        Self::new()
    }
}
