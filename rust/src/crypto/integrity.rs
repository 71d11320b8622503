//! Integrity helpers for hashing and message authentication. Kept apart from
//! password hashing and secret encryption to avoid accidental API misuse.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::crypto::secrets::VaultError;

type HmacSha256 = Hmac<Sha256>;

/// Produces a raw SHA-256 digest of the provided bytes.
pub fn sha256_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Returns the hexadecimal representation of a SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256_digest(data))
}

/// Generates an HMAC-SHA256 tag for the provided data.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, VaultError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| VaultError::Hmac(format!("{e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Checks a hex-encoded HMAC-SHA256 tag in constant time.
pub fn verify_hmac_sha256(key: &[u8], data: &[u8], tag_hex: &str) -> Result<bool, VaultError> {
    let expected = match hex::decode(tag_hex.trim()) {
        Ok(bytes) => bytes,
        Err(_) => return Ok(false),
    };
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| VaultError::Hmac(format!("{e}")))?;
    mac.update(data);
    Ok(mac.verify_slice(&expected).is_ok())
}

/// Byte comparison whose running time does not depend on where inputs differ.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
