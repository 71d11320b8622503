//! Authenticated encryption of secrets at rest.
//! Every blob is sealed under a subkey derived from a versioned master key and a
//! fresh salt, so the master key itself never feeds the cipher directly.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use chacha20poly1305::ChaCha20Poly1305;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

pub const MASTER_KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 64;
pub const TAG_LEN: usize = 16;
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

const AES_IV_LEN: usize = 16;
const CHACHA_NONCE_LEN: usize = 12;
const BLOB_SCHEMA: &str = "v1";
const TOKEN_SEGMENTS: usize = 7;

/// AES-256-GCM with the 16-byte IV used by the blob format.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault is not initialized")]
    NotInitialized,
    #[error("vault configuration error: {0}")]
    Configuration(String),
    #[error("invalid key length; expected 32 bytes")]
    InvalidKeyLength,
    #[error("key source unreadable: {0}")]
    KeySourceUnreadable(String),
    #[error("no retained master key for version {0}")]
    KeyNotFound(u32),
    #[error("authentication failed; ciphertext was altered or the key is wrong")]
    AuthenticationFailure,
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("malformed encrypted blob: {0}")]
    MalformedBlob(String),
    #[error("unsupported cipher algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("hmac failed: {0}")]
    Hmac(String),
}

/// AEAD constructions a blob can be sealed with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherAlgorithm {
    #[default]
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl CipherAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            CipherAlgorithm::Aes256Gcm => "aes-256-gcm",
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }

    pub fn iv_len(&self) -> usize {
        match self {
            CipherAlgorithm::Aes256Gcm => AES_IV_LEN,
            CipherAlgorithm::ChaCha20Poly1305 => CHACHA_NONCE_LEN,
        }
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherAlgorithm {
    type Err = VaultError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "aes-256-gcm" => Ok(CipherAlgorithm::Aes256Gcm),
            "chacha20-poly1305" => Ok(CipherAlgorithm::ChaCha20Poly1305),
            other => Err(VaultError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// One generation of master key material. The bytes are wiped when the last
/// reference is dropped.
pub struct MasterKey {
    version: u32,
    material: Zeroizing<[u8; MASTER_KEY_LEN]>,
    created_at: DateTime<Utc>,
}

impl MasterKey {
    /// Wraps existing key bytes. The slice must be exactly 32 bytes.
    pub fn from_bytes(version: u32, bytes: &[u8]) -> Result<Self, VaultError> {
        if bytes.len() != MASTER_KEY_LEN {
            return Err(VaultError::InvalidKeyLength);
        }
        let mut material = Zeroizing::new([0u8; MASTER_KEY_LEN]);
        material.copy_from_slice(bytes);
        Ok(Self {
            version,
            material,
            created_at: Utc::now(),
        })
    }

    /// Draws fresh key material from the operating system CSPRNG.
    pub fn generate(version: u32) -> Self {
        let mut material = Zeroizing::new([0u8; MASTER_KEY_LEN]);
        OsRng.fill_bytes(material.as_mut());
        Self {
            version,
            material,
            created_at: Utc::now(),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn material(&self) -> &[u8] {
        self.material.as_ref()
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("version", &self.version)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// The current master key plus a bounded, oldest-first queue of prior versions.
#[derive(Debug)]
pub struct KeyRing {
    current: Arc<MasterKey>,
    retained: VecDeque<Arc<MasterKey>>,
    max_retained: usize,
}

/// Outcome of a single rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rotation {
    pub previous_version: u32,
    pub current_version: u32,
    pub evicted_version: Option<u32>,
}

impl KeyRing {
    pub fn new(initial: MasterKey, max_retained: usize) -> Self {
        Self {
            current: Arc::new(initial),
            retained: VecDeque::with_capacity(max_retained),
            max_retained,
        }
    }

    pub fn current(&self) -> Arc<MasterKey> {
        Arc::clone(&self.current)
    }

    /// Looks up the key for `version` among the current and retained keys.
    pub fn find(&self, version: u32) -> Option<Arc<MasterKey>> {
        if self.current.version == version {
            return Some(self.current());
        }
        self.retained
            .iter()
            .find(|key| key.version == version)
            .map(Arc::clone)
    }

    /// Archives the current key and promotes a freshly generated one.
    pub fn rotate(&mut self) -> Rotation {
        let next = MasterKey::generate(self.current.version + 1);
        self.promote(next)
    }

    fn promote(&mut self, next: MasterKey) -> Rotation {
        let previous = std::mem::replace(&mut self.current, Arc::new(next));
        let previous_version = previous.version;
        self.retained.push_back(previous);

        // Only one key is archived per rotation, so at most one falls off.
        let evicted_version = if self.retained.len() > self.max_retained {
            self.retained.pop_front().map(|key| key.version)
        } else {
            None
        };

        Rotation {
            previous_version,
            current_version: self.current.version,
            evicted_version,
        }
    }

    pub fn retained_versions(&self) -> Vec<u32> {
        self.retained.iter().map(|key| key.version).collect()
    }

    pub fn max_retained(&self) -> usize {
        self.max_retained
    }
}

/// Sealed secret plus everything needed to open it again, except the key.
///
/// Serializes as an opaque versioned token:
/// `v1.<algorithm>.<keyVersion>.<salt>.<iv>.<ciphertext>.<tag>` with unpadded
/// base64 segments.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EncryptedBlob {
    pub algorithm: CipherAlgorithm,
    pub key_version: u32,
    pub salt: Vec<u8>,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
}

impl EncryptedBlob {
    pub fn to_token(&self) -> String {
        format!(
            "{BLOB_SCHEMA}.{}.{}.{}.{}.{}.{}",
            self.algorithm,
            self.key_version,
            STANDARD_NO_PAD.encode(&self.salt),
            STANDARD_NO_PAD.encode(&self.iv),
            STANDARD_NO_PAD.encode(&self.ciphertext),
            STANDARD_NO_PAD.encode(&self.tag),
        )
    }

    pub fn from_token(token: &str) -> Result<Self, VaultError> {
        let parts: Vec<&str> = token.trim().split('.').collect();
        if parts.len() != TOKEN_SEGMENTS {
            return Err(VaultError::MalformedBlob(format!(
                "expected {TOKEN_SEGMENTS} segments, found {}",
                parts.len()
            )));
        }
        if parts[0] != BLOB_SCHEMA {
            return Err(VaultError::MalformedBlob(format!(
                "unknown schema version {}",
                parts[0]
            )));
        }

        let algorithm: CipherAlgorithm = parts[1].parse()?;
        let key_version = parts[2]
            .parse::<u32>()
            .map_err(|e| VaultError::MalformedBlob(format!("key version: {e}")))?;
        let decode = |label: &str, segment: &str| {
            STANDARD_NO_PAD
                .decode(segment.as_bytes())
                .map_err(|e| VaultError::MalformedBlob(format!("{label}: {e}")))
        };

        let blob = Self {
            algorithm,
            key_version,
            salt: decode("salt", parts[3])?,
            iv: decode("iv", parts[4])?,
            ciphertext: decode("ciphertext", parts[5])?,
            tag: decode("tag", parts[6])?,
        };
        blob.check_shape()?;
        Ok(blob)
    }

    fn check_shape(&self) -> Result<(), VaultError> {
        if self.salt.len() != SALT_LEN {
            return Err(VaultError::MalformedBlob("salt length mismatch".to_string()));
        }
        if self.iv.len() != self.algorithm.iv_len() {
            return Err(VaultError::MalformedBlob("iv length mismatch".to_string()));
        }
        if self.tag.len() != TAG_LEN {
            return Err(VaultError::MalformedBlob("tag length mismatch".to_string()));
        }
        Ok(())
    }
}

impl fmt::Debug for EncryptedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedBlob")
            .field("algorithm", &self.algorithm)
            .field("key_version", &self.key_version)
            .field("ciphertext_len", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for EncryptedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_token())
    }
}

impl FromStr for EncryptedBlob {
    type Err = VaultError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        Self::from_token(token)
    }
}

impl TryFrom<String> for EncryptedBlob {
    type Error = VaultError;

    fn try_from(token: String) -> Result<Self, Self::Error> {
        Self::from_token(&token)
    }
}

impl From<EncryptedBlob> for String {
    fn from(blob: EncryptedBlob) -> Self {
        blob.to_token()
    }
}

/// Stretches the master key with a per-blob salt into a one-off cipher key.
fn derive_subkey(master: &MasterKey, salt: &[u8], iterations: u32) -> Zeroizing<[u8; MASTER_KEY_LEN]> {
    let mut subkey = Zeroizing::new([0u8; MASTER_KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(master.material(), salt, iterations, subkey.as_mut());
    subkey
}

/// Encrypts `plaintext` under a subkey of `master`, recording the key version
/// that was actually used.
pub fn seal(
    master: &MasterKey,
    algorithm: CipherAlgorithm,
    iterations: u32,
    plaintext: &[u8],
) -> Result<EncryptedBlob, VaultError> {
    let mut salt = vec![0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut iv = vec![0u8; algorithm.iv_len()];
    OsRng.fill_bytes(&mut iv);

    let subkey = derive_subkey(master, &salt, iterations);
    let mut ciphertext = match algorithm {
        CipherAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm16::new_from_slice(subkey.as_ref())
                .map_err(|e| VaultError::EncryptionFailed(format!("{e}")))?;
            cipher.encrypt(GenericArray::from_slice(&iv), plaintext)
        }
        CipherAlgorithm::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(subkey.as_ref())
                .map_err(|e| VaultError::EncryptionFailed(format!("{e}")))?;
            cipher.encrypt(GenericArray::from_slice(&iv), plaintext)
        }
    }
    .map_err(|e| VaultError::EncryptionFailed(format!("{e}")))?;

    if ciphertext.len() < TAG_LEN {
        return Err(VaultError::EncryptionFailed(
            "ciphertext shorter than authentication tag".to_string(),
        ));
    }
    let tag = ciphertext.split_off(ciphertext.len() - TAG_LEN);

    Ok(EncryptedBlob {
        algorithm,
        key_version: master.version(),
        salt,
        iv,
        ciphertext,
        tag,
    })
}

/// Authenticates and decrypts a blob. Nothing is returned unless the tag
/// verifies.
pub fn open(
    master: &MasterKey,
    blob: &EncryptedBlob,
    iterations: u32,
) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    if master.version() != blob.key_version {
        return Err(VaultError::KeyNotFound(blob.key_version));
    }
    blob.check_shape()?;

    let mut combined = Vec::with_capacity(blob.ciphertext.len() + blob.tag.len());
    combined.extend_from_slice(&blob.ciphertext);
    combined.extend_from_slice(&blob.tag);

    let subkey = derive_subkey(master, &blob.salt, iterations);
    let plaintext = match blob.algorithm {
        CipherAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm16::new_from_slice(subkey.as_ref())
                .map_err(|_| VaultError::AuthenticationFailure)?;
            cipher.decrypt(GenericArray::from_slice(&blob.iv), combined.as_ref())
        }
        CipherAlgorithm::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(subkey.as_ref())
                .map_err(|_| VaultError::AuthenticationFailure)?;
            cipher.decrypt(GenericArray::from_slice(&blob.iv), combined.as_ref())
        }
    }
    .map_err(|_| VaultError::AuthenticationFailure)?;

    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST_ITERATIONS: u32 = 1_000;

    fn key(version: u32) -> MasterKey {
        MasterKey::from_bytes(version, &[42u8; 32]).expect("key should be valid")
    }

    #[test]
    fn seals_and_opens_round_trip() {
        let master = key(1);
        let blob = seal(&master, CipherAlgorithm::Aes256Gcm, FAST_ITERATIONS, b"secret-token")
            .expect("encryption should succeed");
        assert_eq!(blob.key_version, 1);
        assert_eq!(blob.salt.len(), SALT_LEN);
        assert_eq!(blob.iv.len(), 16);
        let plaintext = open(&master, &blob, FAST_ITERATIONS).expect("decryption should succeed");
        assert_eq!(plaintext.as_slice(), b"secret-token");
    }

    #[test]
    fn chacha_blobs_use_twelve_byte_nonces() {
        let master = key(1);
        let blob = seal(&master, CipherAlgorithm::ChaCha20Poly1305, FAST_ITERATIONS, b"payload")
            .expect("encryption should work");
        assert_eq!(blob.iv.len(), 12);
        let plaintext = open(&master, &blob, FAST_ITERATIONS).expect("decryption should work");
        assert_eq!(plaintext.as_slice(), b"payload");
    }

    #[test]
    fn same_plaintext_yields_distinct_blobs() {
        let master = key(1);
        let a = seal(&master, CipherAlgorithm::Aes256Gcm, FAST_ITERATIONS, b"same").unwrap();
        let b = seal(&master, CipherAlgorithm::Aes256Gcm, FAST_ITERATIONS, b"same").unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn bit_flips_fail_authentication() {
        let master = key(1);
        let blob = seal(&master, CipherAlgorithm::Aes256Gcm, FAST_ITERATIONS, b"hello-secret").unwrap();

        for index in 0..blob.ciphertext.len() {
            for bit in 0..8 {
                let mut tampered = blob.clone();
                tampered.ciphertext[index] ^= 1 << bit;
                let err = open(&master, &tampered, FAST_ITERATIONS).unwrap_err();
                assert!(matches!(err, VaultError::AuthenticationFailure));
            }
        }
        for index in 0..TAG_LEN {
            let mut tampered = blob.clone();
            tampered.tag[index] ^= 0x80;
            let err = open(&master, &tampered, FAST_ITERATIONS).unwrap_err();
            assert!(matches!(err, VaultError::AuthenticationFailure));
        }
    }

    #[test]
    fn token_survives_serialization() {
        let master = key(7);
        let blob = seal(&master, CipherAlgorithm::Aes256Gcm, FAST_ITERATIONS, b"x").unwrap();
        let token = blob.to_token();
        assert!(token.starts_with("v1.aes-256-gcm.7."));

        let parsed: EncryptedBlob = token.parse().expect("token should parse");
        assert_eq!(parsed, blob);

        let json = serde_json::to_string(&blob).unwrap();
        assert_eq!(json, format!("\"{token}\""));
        let back: EncryptedBlob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, blob);
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert!(matches!(
            EncryptedBlob::from_token("v1.aes-256-gcm.1.abc"),
            Err(VaultError::MalformedBlob(_))
        ));
        assert!(matches!(
            EncryptedBlob::from_token("v9.aes-256-gcm.1.a.b.c.d"),
            Err(VaultError::MalformedBlob(_))
        ));
        assert!(matches!(
            EncryptedBlob::from_token("v1.rot13.1.a.b.c.d"),
            Err(VaultError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn key_ring_evicts_oldest_first() {
        let mut ring = KeyRing::new(MasterKey::generate(1), 2);
        let first = ring.rotate();
        assert_eq!(first.current_version, 2);
        assert_eq!(first.evicted_version, None);
        ring.rotate();
        let third = ring.rotate();
        assert_eq!(third.evicted_version, Some(1));
        assert_eq!(ring.retained_versions(), vec![2, 3]);
        assert!(ring.find(1).is_none());
        assert_eq!(ring.find(4).map(|k| k.version()), Some(4));
    }

    #[test]
    fn rejects_bad_keys() {
        let err = MasterKey::from_bytes(1, &[1u8; 16]).unwrap_err();
        assert!(format!("{err}").contains("invalid key length"));
    }
}
