//! Password hashing helpers built around PBKDF2-HMAC-SHA256.
//! Hashes are self-describing strings so the iteration count can be raised
//! later without invalidating stored hashes.
//!
//! Format: `pbkdf2-sha256$<iterations>$<salt>$<hash>` with unpadded base64.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

const SCHEME: &str = "pbkdf2-sha256";
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// Hashes a password-like secret with a random per-hash salt.
pub fn hash_password(plaintext: &str, iterations: u32) -> String {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let mut derived = Zeroizing::new([0u8; HASH_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(plaintext.as_bytes(), &salt, iterations, derived.as_mut());

    format!(
        "{SCHEME}${iterations}${}${}",
        STANDARD_NO_PAD.encode(salt),
        STANDARD_NO_PAD.encode(derived.as_ref())
    )
}

/// Verifies a plaintext password against a stored hash.
/// Returns `false` for mismatches and for hashes that do not parse.
pub fn verify_password(plaintext: &str, stored_hash: &str) -> bool {
    let parsed = match ParsedHash::parse(stored_hash) {
        Some(parsed) => parsed,
        None => return false,
    };

    let mut derived = Zeroizing::new(vec![0u8; parsed.hash.len()]);
    pbkdf2::pbkdf2_hmac::<Sha256>(plaintext.as_bytes(), &parsed.salt, parsed.iterations, &mut derived);

    derived.as_slice().ct_eq(&parsed.hash).into()
}

/// Iteration count encoded in a stored hash, if it parses.
pub fn hash_iterations(stored_hash: &str) -> Option<u32> {
    ParsedHash::parse(stored_hash).map(|parsed| parsed.iterations)
}

struct ParsedHash {
    iterations: u32,
    salt: Vec<u8>,
    hash: Vec<u8>,
}

impl ParsedHash {
    fn parse(stored: &str) -> Option<Self> {
        let mut parts = stored.split('$');
        if parts.next()? != SCHEME {
            return None;
        }
        let iterations = parts.next()?.parse::<u32>().ok().filter(|n| *n > 0)?;
        let salt = STANDARD_NO_PAD.decode(parts.next()?).ok()?;
        let hash = STANDARD_NO_PAD.decode(parts.next()?).ok()?;
        if parts.next().is_some() || hash.is_empty() {
            return None;
        }
        Some(Self { iterations, salt, hash })
    }
}

#[cfg(test)]
mod tests {
    use super::{hash_iterations, hash_password, verify_password};

    #[test]
    fn hashes_and_verifies_passwords() {
        let hash = hash_password("vaultline-test-password", 1_000);
        assert!(verify_password("vaultline-test-password", &hash));
        assert!(!verify_password("wrong-password", &hash));
    }

    #[test]
    fn encodes_iteration_count() {
        let hash = hash_password("pw", 2_500);
        assert!(hash.starts_with("pbkdf2-sha256$2500$"));
        assert_eq!(hash_iterations(&hash), Some(2_500));
    }

    #[test]
    fn salts_every_hash() {
        assert_ne!(hash_password("pw", 1_000), hash_password("pw", 1_000));
    }

    #[test]
    fn rejects_garbage_hashes() {
        assert!(!verify_password("pw", ""));
        assert!(!verify_password("pw", "argon2id$v=19$whatever"));
        assert!(!verify_password("pw", "pbkdf2-sha256$0$AAAA$AAAA"));
        assert!(!verify_password("pw", "pbkdf2-sha256$1000$!!!$AAAA"));
    }
}
