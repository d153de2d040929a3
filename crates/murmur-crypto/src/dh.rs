//! Ephemeral finite-field Diffie-Hellman over the 2048-bit MODP group
//! (RFC 3526 group 14, generator 2). Public values are exactly 256
//! bytes big-endian, matching the handshake record layout.

use num_bigint_dig::BigUint;
use rand::RngCore;

use crate::CryptoError;

/// RFC 3526 group 14 prime.
const MODP_2048_HEX: &str = "\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

/// Public value length in bytes.
pub const DH_PUB_LEN: usize = 256;

fn group_prime() -> BigUint {
    BigUint::parse_bytes(MODP_2048_HEX.as_bytes(), 16).expect("group prime constant")
}

/// One side of an ephemeral Diffie-Hellman exchange.
pub struct DhKeypair {
    prime: BigUint,
    secret: BigUint,
    public: Vec<u8>,
}

impl DhKeypair {
    /// Generate a fresh ephemeral keypair.
    pub fn generate() -> Self {
        let prime = group_prime();
        let generator = BigUint::from(2u8);
        // 256-bit exponent, twice the group's security level.
        let mut exponent = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut exponent);
        let secret = BigUint::from_bytes_be(&exponent);
        let public = generator.modpow(&secret, &prime);
        Self {
            public: to_fixed_be(&public),
            prime,
            secret,
        }
    }

    /// The 256-byte public value to place in the handshake record.
    pub fn public_bytes(&self) -> &[u8] {
        &self.public
    }

    /// Complete the exchange with the remote public value. Rejects
    /// degenerate values (0, 1, p-1 and out-of-range).
    pub fn shared_secret(&self, peer_pub: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if peer_pub.len() != DH_PUB_LEN {
            return Err(CryptoError::DhPublicOutOfRange);
        }
        let peer = BigUint::from_bytes_be(peer_pub);
        let two = BigUint::from(2u8);
        if peer < two || peer >= &self.prime - &two {
            return Err(CryptoError::DhPublicOutOfRange);
        }
        let shared = peer.modpow(&self.secret, &self.prime);
        Ok(to_fixed_be(&shared))
    }
}

/// Left-pad a big-endian value to the group size.
fn to_fixed_be(value: &BigUint) -> Vec<u8> {
    let raw = value.to_bytes_be();
    let mut out = vec![0u8; DH_PUB_LEN - raw.len()];
    out.extend_from_slice(&raw);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_value_is_group_sized() {
        let kp = DhKeypair::generate();
        assert_eq!(kp.public_bytes().len(), DH_PUB_LEN);
    }

    #[test]
    fn test_both_sides_agree() {
        let a = DhKeypair::generate();
        let b = DhKeypair::generate();
        let sa = a.shared_secret(b.public_bytes()).unwrap();
        let sb = b.shared_secret(a.public_bytes()).unwrap();
        assert_eq!(sa, sb);
        assert_eq!(sa.len(), DH_PUB_LEN);
    }

    #[test]
    fn test_distinct_exchanges_differ() {
        let a = DhKeypair::generate();
        let b = DhKeypair::generate();
        let c = DhKeypair::generate();
        let sab = a.shared_secret(b.public_bytes()).unwrap();
        let sac = a.shared_secret(c.public_bytes()).unwrap();
        assert_ne!(sab, sac);
    }

    #[test]
    fn test_degenerate_public_values_rejected() {
        let kp = DhKeypair::generate();
        assert!(kp.shared_secret(&[0u8; DH_PUB_LEN]).is_err());
        let mut one = vec![0u8; DH_PUB_LEN];
        one[DH_PUB_LEN - 1] = 1;
        assert!(kp.shared_secret(&one).is_err());
        assert!(kp.shared_secret(&[0xFF; DH_PUB_LEN]).is_err());
        assert!(kp.shared_secret(&[1u8; 100]).is_err());
    }
}
