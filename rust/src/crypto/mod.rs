//! Cryptographic primitives used by the vault: authenticated encryption under
//! versioned master keys, password hashing, message authentication, and a few
//! redaction and identifier helpers. Nothing in here holds shared state.

pub mod integrity;
pub mod passwords;
pub mod sanitize;
pub mod secrets;
pub mod tokens;
