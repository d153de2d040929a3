//! Admission puzzle -- memory-hard scrypt hash with a bigint threshold
//! acceptance condition, shared by the transport handshake and the
//! membership limited push.
//!
//! A candidate nonce is admissible iff
//! `bigint(scrypt(input || nonce, salt = nonce)) <= (2^(8*dk_len) - 1) / repetition`,
//! which makes the expected work `repetition` scrypt evaluations.

use num_bigint_dig::BigUint;
use rand::RngCore;

use crate::CryptoError;

/// Cost and acceptance parameters for one puzzle domain.
#[derive(Debug, Clone, Copy)]
pub struct PuzzleParams {
    /// scrypt cost exponent: N = 2^log_n.
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
    /// scrypt output length in bytes.
    pub dk_len: usize,
    /// Expected number of evaluations to find an admissible nonce.
    pub repetition: u64,
}

impl PuzzleParams {
    /// Acceptance threshold `(2^(8*dk_len) - 1) / repetition`.
    pub fn threshold(&self) -> BigUint {
        let max = (BigUint::from(1u8) << (8 * self.dk_len)) - BigUint::from(1u8);
        max / BigUint::from(self.repetition)
    }

    fn scrypt_params(&self) -> scrypt::Params {
        scrypt::Params::new(self.log_n, self.r, self.p, self.dk_len)
            .expect("puzzle scrypt parameters")
    }
}

/// Evaluate the puzzle hash for a candidate nonce.
pub fn puzzle_hash(
    params: &PuzzleParams,
    input: &[u8],
    nonce: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut password = Vec::with_capacity(input.len() + nonce.len());
    password.extend_from_slice(input);
    password.extend_from_slice(nonce);

    let mut out = vec![0u8; params.dk_len];
    scrypt::scrypt(&password, nonce, &params.scrypt_params(), &mut out)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(out)
}

/// True iff the nonce satisfies the acceptance condition.
pub fn verify(params: &PuzzleParams, input: &[u8], nonce: &[u8]) -> Result<bool, CryptoError> {
    let hash = puzzle_hash(params, input, nonce)?;
    Ok(BigUint::from_bytes_be(&hash) <= params.threshold())
}

/// Search for an admissible byte nonce of the given length. Tries up to
/// `2 * repetition` candidates before giving up.
pub fn solve_bytes(
    params: &PuzzleParams,
    input: &[u8],
    nonce_len: usize,
) -> Result<Vec<u8>, CryptoError> {
    let mut rng = rand::thread_rng();
    let mut nonce = vec![0u8; nonce_len];
    for _ in 0..2 * params.repetition {
        rng.fill_bytes(&mut nonce);
        if verify(params, input, &nonce)? {
            return Ok(nonce);
        }
    }
    Err(CryptoError::PuzzleExhausted)
}

/// Search for an admissible u64 nonce, starting from a random value and
/// incrementing. The input for each candidate is produced by `input_for`
/// (the nonce is embedded in the covered bytes as well as the salt).
pub fn solve_u64<F>(params: &PuzzleParams, input_for: F) -> Result<u64, CryptoError>
where
    F: Fn(u64) -> Vec<u8>,
{
    let mut nonce = rand::thread_rng().next_u64();
    for _ in 0..2 * params.repetition {
        let input = input_for(nonce);
        let hash = {
            let mut out = vec![0u8; params.dk_len];
            scrypt::scrypt(
                &input,
                &nonce.to_be_bytes(),
                &params.scrypt_params(),
                &mut out,
            )
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
            out
        };
        if BigUint::from_bytes_be(&hash) <= params.threshold() {
            return Ok(nonce);
        }
        nonce = nonce.wrapping_add(1);
    }
    Err(CryptoError::PuzzleExhausted)
}

/// Verify a u64 nonce produced by `solve_u64`.
pub fn verify_u64(
    params: &PuzzleParams,
    input: &[u8],
    nonce: u64,
) -> Result<bool, CryptoError> {
    let mut out = vec![0u8; params.dk_len];
    scrypt::scrypt(input, &nonce.to_be_bytes(), &params.scrypt_params(), &mut out)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(BigUint::from_bytes_be(&out) <= params.threshold())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Cheap cost settings; the acceptance logic is parameter independent.
    fn easy() -> PuzzleParams {
        PuzzleParams {
            log_n: 4,
            r: 8,
            p: 1,
            dk_len: 32,
            repetition: 2,
        }
    }

    #[test]
    fn test_threshold_divides_range() {
        let params = easy();
        let max = (BigUint::from(1u8) << 256) - BigUint::from(1u8);
        assert_eq!(params.threshold(), max / BigUint::from(2u8));

        let harder = PuzzleParams {
            repetition: 1024,
            ..params
        };
        assert!(harder.threshold() < params.threshold());
    }

    #[test]
    fn test_solved_bytes_nonce_verifies() {
        let params = easy();
        let nonce = solve_bytes(&params, b"handshake input", 64).unwrap();
        assert_eq!(nonce.len(), 64);
        assert!(verify(&params, b"handshake input", &nonce).unwrap());
    }

    #[test]
    fn test_nonce_bound_to_input() {
        // With repetition = 1 the threshold is the whole range, so any
        // nonce verifies; tie the check to a hard threshold instead.
        let params = PuzzleParams {
            repetition: 1 << 20,
            ..easy()
        };
        // A random nonce almost surely fails a 2^-20 threshold.
        assert!(!verify(&params, b"input", &[0xA5; 64]).unwrap());
    }

    #[test]
    fn test_solve_u64_roundtrip() {
        let params = easy();
        let make_input = |nonce: u64| {
            let mut v = b"push request".to_vec();
            v.extend_from_slice(&nonce.to_be_bytes());
            v
        };
        let nonce = solve_u64(&params, make_input).unwrap();
        assert!(verify_u64(&params, &make_input(nonce), nonce).unwrap());
    }

    #[test]
    fn test_repetition_one_accepts_everything() {
        let params = PuzzleParams {
            repetition: 1,
            ..easy()
        };
        assert!(verify(&params, b"any input", &[0u8; 64]).unwrap());
    }
}
