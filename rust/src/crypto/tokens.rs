//! CSPRNG-backed identifiers.

use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;

/// Returns `len` random bytes from the operating system, hex encoded.
pub fn generate_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Random (version 4) UUID in its hyphenated form.
pub fn generate_uuid() -> String {
    Uuid::new_v4().to_string()
}
