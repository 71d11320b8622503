//! The vault owns the master key lifecycle and exposes the cryptographic
//! operations the rest of the system needs: sealing secrets at rest, key
//! rotation, password hashing and message authentication.
//!
//! Keys live behind a read/write lock. Readers clone an `Arc` to the key they
//! need and release the lock before doing any expensive derivation, so a
//! rotation swaps the current key atomically while in-flight operations finish
//! with the generation they started with. Each blob records the version it was
//! actually sealed under.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use sha2::Sha256;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::audit::{AuditLog, SecurityEventKind};
use crate::config::{RuntimeEnvironment, VaultSettings};
use crate::crypto::integrity::{hmac_sha256, verify_hmac_sha256};
use crate::crypto::secrets::{
    self, CipherAlgorithm, EncryptedBlob, KeyRing, MasterKey, Rotation, VaultError, MASTER_KEY_LEN,
};
use crate::crypto::{passwords, sanitize, tokens};

const DEV_PASSPHRASE: &str = "vaultline-development-master-key";
const DEV_SALT: &[u8] = b"vaultline-development-salt";
const INITIAL_KEY_VERSION: u32 = 1;

/// Where the master key comes from.
pub enum MasterKeySource {
    /// Hex-encoded key supplied directly by the host process.
    Hex(Zeroizing<String>),
    /// Environment variable holding the hex-encoded key.
    EnvVar(String),
    /// File holding the hex-encoded key.
    File(PathBuf),
    /// No external key; only acceptable outside production.
    Unset,
}

impl fmt::Debug for MasterKeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MasterKeySource::Hex(_) => f.write_str("Hex(<redacted>)"),
            MasterKeySource::EnvVar(var) => f.debug_tuple("EnvVar").field(var).finish(),
            MasterKeySource::File(path) => f.debug_tuple("File").field(path).finish(),
            MasterKeySource::Unset => f.write_str("Unset"),
        }
    }
}

/// Non-secret operational metadata.
#[derive(Debug, Clone, Serialize)]
pub struct VaultStatus {
    pub initialized: bool,
    pub environment: RuntimeEnvironment,
    pub algorithm: CipherAlgorithm,
    pub kdf_iterations: u32,
    pub current_key_version: Option<u32>,
    pub current_key_created_at: Option<DateTime<Utc>>,
    pub retained_key_versions: Vec<u32>,
    pub max_retained_keys: usize,
    pub rotation_interval_days: u32,
    pub rotation_due: bool,
    pub audit_event_count: usize,
}

pub struct VaultManager {
    settings: VaultSettings,
    ring: RwLock<Option<KeyRing>>,
    audit: Arc<AuditLog>,
}

impl VaultManager {
    /// Creates an uninitialized vault. Call [`VaultManager::initialize`] before
    /// encrypting anything.
    pub fn new(settings: VaultSettings, audit: Arc<AuditLog>) -> Self {
        Self {
            settings,
            ring: RwLock::new(None),
            audit,
        }
    }

    /// Loads the master key from `source`. Outside production a missing key
    /// falls back to a fixed development key; in production it is fatal.
    pub fn initialize(&self, source: MasterKeySource) -> Result<(), VaultError> {
        if self.ring.read().is_some() {
            warn!("vault already initialized; keeping the existing key ring");
            return Ok(());
        }

        let origin = match &source {
            MasterKeySource::Hex(_) => "inline",
            MasterKeySource::EnvVar(_) => "env",
            MasterKeySource::File(_) => "file",
            MasterKeySource::Unset => "unset",
        };
        let master = match load_key_bytes(&source)? {
            Some(bytes) => MasterKey::from_bytes(INITIAL_KEY_VERSION, &bytes)?,
            None if self.settings.environment.is_production() => {
                return Err(VaultError::Configuration(format!(
                    "no master key available from {source:?}; a key is required in production"
                )));
            }
            None => {
                warn!(
                    environment = ?self.settings.environment,
                    "no master key configured; deriving the development key"
                );
                development_key()?
            }
        };

        let mut ring = self.ring.write();
        if ring.is_some() {
            return Ok(());
        }
        *ring = Some(KeyRing::new(master, self.settings.max_retained_keys));
        drop(ring);

        info!(origin, algorithm = %self.settings.algorithm, "vault initialized");
        self.audit.record(
            SecurityEventKind::VaultInitialized,
            [("origin", origin.to_string()), ("key_version", INITIAL_KEY_VERSION.to_string())],
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.ring.read().is_some()
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    fn current_key(&self) -> Result<Arc<MasterKey>, VaultError> {
        self.ring
            .read()
            .as_ref()
            .map(KeyRing::current)
            .ok_or(VaultError::NotInitialized)
    }

    fn key_for(&self, version: u32) -> Result<Option<Arc<MasterKey>>, VaultError> {
        let ring = self.ring.read();
        let ring = ring.as_ref().ok_or(VaultError::NotInitialized)?;
        Ok(ring.find(version))
    }

    /// Seals `plaintext` under the current key with a fresh salt and IV.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedBlob, VaultError> {
        let sealed = self.current_key().and_then(|key| {
            secrets::seal(&key, self.settings.algorithm, self.settings.kdf_iterations, plaintext)
        });
        let blob = match sealed {
            Ok(blob) => blob,
            Err(err) => {
                warn!(error = %err, "encryption failed");
                let reason = match &err {
                    VaultError::NotInitialized => "not_initialized",
                    _ => "cipher",
                };
                self.audit.record(
                    SecurityEventKind::EncryptFailed,
                    [("algorithm", self.settings.algorithm.to_string()), ("reason", reason.to_string())],
                );
                return Err(err);
            }
        };

        self.audit.record(
            SecurityEventKind::Encrypt,
            [
                ("key_version", blob.key_version.to_string()),
                ("algorithm", blob.algorithm.to_string()),
            ],
        );
        Ok(blob)
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<EncryptedBlob, VaultError> {
        self.encrypt(plaintext.as_bytes())
    }

    /// Opens a blob with the key generation it records. Fails with
    /// `KeyNotFound` once that generation has been evicted, and with
    /// `AuthenticationFailure` if anything was altered.
    pub fn decrypt(&self, blob: &EncryptedBlob) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let key = match self.key_for(blob.key_version)? {
            Some(key) => key,
            None => {
                warn!(key_version = blob.key_version, "decrypt referenced an evicted key version");
                self.record_decrypt_failure(blob, "key_not_found");
                return Err(VaultError::KeyNotFound(blob.key_version));
            }
        };

        match secrets::open(&key, blob, self.settings.kdf_iterations) {
            Ok(plaintext) => {
                self.audit.record(
                    SecurityEventKind::Decrypt,
                    [("key_version", blob.key_version.to_string())],
                );
                Ok(plaintext)
            }
            Err(err) => {
                warn!(error = %err, key_version = blob.key_version, "decryption failed");
                let reason = match &err {
                    VaultError::AuthenticationFailure => "authentication_failure",
                    _ => "malformed",
                };
                self.record_decrypt_failure(blob, reason);
                Err(err)
            }
        }
    }

    /// Like [`VaultManager::decrypt`] but requires UTF-8 plaintext.
    pub fn decrypt_to_string(&self, blob: &EncryptedBlob) -> Result<Zeroizing<String>, VaultError> {
        let mut plaintext = self.decrypt(blob)?;
        let bytes = std::mem::take(&mut *plaintext);
        match String::from_utf8(bytes) {
            Ok(text) => Ok(Zeroizing::new(text)),
            Err(err) => {
                err.into_bytes().zeroize();
                Err(VaultError::MalformedBlob("plaintext is not valid utf-8".to_string()))
            }
        }
    }

    fn record_decrypt_failure(&self, blob: &EncryptedBlob, reason: &str) {
        self.audit.record(
            SecurityEventKind::DecryptFailed,
            [("key_version", blob.key_version.to_string()), ("reason", reason.to_string())],
        );
    }

    /// Archives the current key and promotes a new random one. Existing blobs
    /// are left alone and stay readable while their version is retained.
    pub fn rotate_key(&self) -> Result<Rotation, VaultError> {
        let rotation = {
            let mut ring = self.ring.write();
            ring.as_mut().ok_or(VaultError::NotInitialized)?.rotate()
        };

        info!(
            previous = rotation.previous_version,
            current = rotation.current_version,
            evicted = ?rotation.evicted_version,
            "master key rotated"
        );
        let mut metadata = vec![
            ("previous_version", rotation.previous_version.to_string()),
            ("new_version", rotation.current_version.to_string()),
        ];
        if let Some(evicted) = rotation.evicted_version {
            metadata.push(("evicted_version", evicted.to_string()));
        }
        self.audit.record(SecurityEventKind::KeyRotated, metadata);
        Ok(rotation)
    }

    /// True when `blob` was sealed under an older key or another algorithm.
    pub fn needs_reencryption(&self, blob: &EncryptedBlob) -> Result<bool, VaultError> {
        let current = self.current_key()?;
        Ok(blob.key_version != current.version() || blob.algorithm != self.settings.algorithm)
    }

    /// Decrypts `blob` and seals the plaintext again under the current key.
    /// Callers persisting blobs use this to migrate data before its key
    /// version ages out of the retained set.
    pub fn reencrypt(&self, blob: &EncryptedBlob) -> Result<EncryptedBlob, VaultError> {
        let plaintext = self.decrypt(blob)?;
        let fresh = self.encrypt(&plaintext)?;
        self.audit.record(
            SecurityEventKind::Reencrypt,
            [
                ("from_version", blob.key_version.to_string()),
                ("to_version", fresh.key_version.to_string()),
            ],
        );
        Ok(fresh)
    }

    pub fn hash_password(&self, password: &str) -> String {
        let hash = passwords::hash_password(password, self.settings.kdf_iterations);
        self.audit.record(
            SecurityEventKind::PasswordHashed,
            [("iterations", self.settings.kdf_iterations)],
        );
        hash
    }

    pub fn verify_password(&self, password: &str, stored_hash: &str) -> bool {
        let matched = passwords::verify_password(password, stored_hash);
        self.audit
            .record(SecurityEventKind::PasswordVerified, [("matched", matched)]);
        matched
    }

    /// Hex HMAC-SHA256 of `data`, keyed by `secret` or, when absent, by the
    /// current master key. Tags keyed by the master key stop verifying after
    /// a rotation.
    pub fn create_hmac(&self, data: &[u8], secret: Option<&[u8]>) -> Result<String, VaultError> {
        let tag = match secret {
            Some(secret) => hmac_sha256(secret, data)?,
            None => hmac_sha256(self.current_key()?.material(), data)?,
        };
        self.audit.record(
            SecurityEventKind::HmacCreated,
            [("keyed_by", if secret.is_some() { "caller" } else { "master" })],
        );
        Ok(hex::encode(tag))
    }

    /// Constant-time check of a tag produced by [`VaultManager::create_hmac`].
    pub fn verify_hmac(&self, data: &[u8], tag_hex: &str, secret: Option<&[u8]>) -> Result<bool, VaultError> {
        let matched = match secret {
            Some(secret) => verify_hmac_sha256(secret, data, tag_hex)?,
            None => verify_hmac_sha256(self.current_key()?.material(), data, tag_hex)?,
        };
        self.audit
            .record(SecurityEventKind::HmacVerified, [("matched", matched)]);
        Ok(matched)
    }

    /// See [`sanitize::sanitize_connection_string`]. Not a substitute for
    /// keeping credentials out of connection strings.
    pub fn sanitize_connection_string(&self, raw: &str) -> String {
        sanitize::sanitize_connection_string(raw)
    }

    /// See [`sanitize::sanitize_sql_input`]. Not a substitute for
    /// parameterized queries.
    pub fn sanitize_sql_input(&self, input: &str) -> String {
        sanitize::sanitize_sql_input(input)
    }

    pub fn generate_token(&self, len: usize) -> String {
        tokens::generate_token(len)
    }

    pub fn generate_uuid(&self) -> String {
        tokens::generate_uuid()
    }

    pub fn status(&self) -> VaultStatus {
        let ring = self.ring.read();
        let current = ring.as_ref().map(KeyRing::current);
        let rotation_due = current.as_ref().map_or(false, |key| {
            let age = Utc::now() - key.created_at();
            age >= ChronoDuration::days(i64::from(self.settings.rotation_interval_days))
        });

        VaultStatus {
            initialized: ring.is_some(),
            environment: self.settings.environment,
            algorithm: self.settings.algorithm,
            kdf_iterations: self.settings.kdf_iterations,
            current_key_version: current.as_ref().map(|key| key.version()),
            current_key_created_at: current.as_ref().map(|key| key.created_at()),
            retained_key_versions: ring.as_ref().map(KeyRing::retained_versions).unwrap_or_default(),
            max_retained_keys: self.settings.max_retained_keys,
            rotation_interval_days: self.settings.rotation_interval_days,
            rotation_due,
            audit_event_count: self.audit.len(),
        }
    }

    /// Drops every key generation. Material is zeroized as the last reference
    /// goes away; subsequent operations fail with `NotInitialized`.
    pub fn shutdown(&self) {
        let ring = self.ring.write().take();
        if ring.is_some() {
            drop(ring);
            info!("vault shut down; key material released");
            self.audit.record_kind(SecurityEventKind::VaultShutdown);
        }
    }
}

impl Drop for VaultManager {
    fn drop(&mut self) {
        if let Some(ring) = self.ring.get_mut().take() {
            debug!(retained = ring.retained_versions().len(), "releasing key ring on drop");
        }
    }
}

fn load_key_bytes(source: &MasterKeySource) -> Result<Option<Zeroizing<Vec<u8>>>, VaultError> {
    match source {
        MasterKeySource::Hex(encoded) => decode_key_hex(encoded).map(Some),
        MasterKeySource::EnvVar(var) => match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => {
                let value = Zeroizing::new(value);
                decode_key_hex(&value).map(Some)
            }
            _ => Ok(None),
        },
        MasterKeySource::File(path) => {
            let content = Zeroizing::new(
                fs::read_to_string(path).map_err(|e| VaultError::KeySourceUnreadable(format!("{e}")))?,
            );
            decode_key_hex(&content).map(Some)
        }
        MasterKeySource::Unset => Ok(None),
    }
}

fn decode_key_hex(encoded: &str) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    let bytes = Zeroizing::new(
        hex::decode(encoded.trim())
            .map_err(|e| VaultError::KeySourceUnreadable(format!("master key is not hex: {e}")))?,
    );
    if bytes.len() != MASTER_KEY_LEN {
        return Err(VaultError::InvalidKeyLength);
    }
    Ok(bytes)
}

fn development_key() -> Result<MasterKey, VaultError> {
    let mut material = Zeroizing::new([0u8; MASTER_KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(
        DEV_PASSPHRASE.as_bytes(),
        DEV_SALT,
        secrets::DEFAULT_KDF_ITERATIONS,
        material.as_mut(),
    );
    MasterKey::from_bytes(INITIAL_KEY_VERSION, material.as_ref())
}

#[cfg(test)]
mod tests {
    use super::{MasterKeySource, VaultManager};
    use crate::audit::{AuditLog, SecurityEventKind};
    use crate::config::{RuntimeEnvironment, VaultSettings};
    use crate::crypto::secrets::{CipherAlgorithm, VaultError};
    use std::sync::Arc;
    use zeroize::Zeroizing;

    const TEST_KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn settings(max_retained_keys: usize) -> VaultSettings {
        VaultSettings {
            environment: RuntimeEnvironment::Test,
            kdf_iterations: 1_000,
            max_retained_keys,
            ..VaultSettings::default()
        }
    }

    fn vault(max_retained_keys: usize) -> VaultManager {
        let vault = VaultManager::new(settings(max_retained_keys), Arc::new(AuditLog::new(100)));
        vault
            .initialize(MasterKeySource::Hex(Zeroizing::new(TEST_KEY_HEX.to_string())))
            .expect("vault should initialize");
        vault
    }

    #[test]
    fn encrypts_and_decrypts_round_trip() {
        let vault = vault(3);
        for plaintext in ["", "a", "hello-secret", "ünïcödé 🔐"] {
            let blob = vault.encrypt_str(plaintext).expect("encryption should succeed");
            let opened = vault.decrypt_to_string(&blob).expect("decryption should succeed");
            assert_eq!(opened.as_str(), plaintext);
        }
    }

    #[test]
    fn tampered_tokens_fail_authentication() {
        let vault = vault(3);
        let blob = vault.encrypt_str("hello-secret").unwrap();
        let mut tampered = blob.clone();
        tampered.tag[0] ^= 1;
        assert!(matches!(vault.decrypt(&tampered), Err(VaultError::AuthenticationFailure)));
        assert_eq!(vault.audit().count(SecurityEventKind::DecryptFailed), 1);
    }

    #[test]
    fn rotated_keys_stay_readable_until_evicted() {
        let vault = vault(1);
        let blob = vault.encrypt_str("hello-secret").unwrap();
        assert_eq!(blob.key_version, 1);

        let rotation = vault.rotate_key().expect("rotation should succeed");
        assert_eq!(rotation.current_version, 2);
        assert_eq!(vault.decrypt_to_string(&blob).unwrap().as_str(), "hello-secret");
        assert_eq!(vault.encrypt_str("later").unwrap().key_version, 2);

        let rotation = vault.rotate_key().unwrap();
        assert_eq!(rotation.evicted_version, Some(1));
        assert!(matches!(vault.decrypt(&blob), Err(VaultError::KeyNotFound(1))));
    }

    #[test]
    fn reencrypts_onto_current_key() {
        let vault = vault(1);
        let blob = vault.encrypt_str("migrate-me").unwrap();
        vault.rotate_key().unwrap();
        assert!(vault.needs_reencryption(&blob).unwrap());

        let fresh = vault.reencrypt(&blob).expect("re-encryption should succeed");
        assert_eq!(fresh.key_version, 2);
        assert!(!vault.needs_reencryption(&fresh).unwrap());

        vault.rotate_key().unwrap();
        assert_eq!(vault.decrypt_to_string(&fresh).unwrap().as_str(), "migrate-me");
    }

    #[test]
    fn production_requires_a_master_key() {
        let settings = VaultSettings {
            environment: RuntimeEnvironment::Production,
            ..VaultSettings::default()
        };
        let vault = VaultManager::new(settings, Arc::new(AuditLog::default()));
        let err = vault.initialize(MasterKeySource::Unset).unwrap_err();
        assert!(matches!(err, VaultError::Configuration(_)));
        assert!(!vault.is_initialized());
    }

    #[test]
    fn development_falls_back_to_derived_key() {
        let vault = VaultManager::new(settings(3), Arc::new(AuditLog::default()));
        vault
            .initialize(MasterKeySource::EnvVar("VAULTLINE_TEST_UNSET_KEY_VAR".to_string()))
            .expect("development key should be derived");
        let blob = vault.encrypt_str("dev").unwrap();
        assert_eq!(vault.decrypt_to_string(&blob).unwrap().as_str(), "dev");
    }

    #[test]
    fn rejects_short_hex_keys() {
        let vault = VaultManager::new(settings(3), Arc::new(AuditLog::default()));
        let err = vault
            .initialize(MasterKeySource::Hex(Zeroizing::new("abcd".to_string())))
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidKeyLength));
    }

    #[test]
    fn reads_key_from_file() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        std::fs::write(file.path(), format!("{TEST_KEY_HEX}\n")).unwrap();
        let vault = VaultManager::new(settings(3), Arc::new(AuditLog::default()));
        vault
            .initialize(MasterKeySource::File(file.path().to_path_buf()))
            .expect("file key should load");
        assert_eq!(vault.status().current_key_version, Some(1));
    }

    #[test]
    fn chacha_vault_round_trips() {
        let settings = VaultSettings {
            algorithm: CipherAlgorithm::ChaCha20Poly1305,
            ..settings(3)
        };
        let vault = VaultManager::new(settings, Arc::new(AuditLog::default()));
        vault.initialize(MasterKeySource::Unset).unwrap();
        let blob = vault.encrypt_str("stream").unwrap();
        assert_eq!(blob.algorithm, CipherAlgorithm::ChaCha20Poly1305);
        assert_eq!(vault.decrypt_to_string(&blob).unwrap().as_str(), "stream");
    }

    #[test]
    fn password_and_hmac_helpers() {
        let vault = vault(3);
        let hash = vault.hash_password("correct horse");
        assert!(vault.verify_password("correct horse", &hash));
        assert!(!vault.verify_password("battery staple", &hash));

        let tag = vault.create_hmac(b"payload", None).unwrap();
        assert!(vault.verify_hmac(b"payload", &tag, None).unwrap());
        assert!(!vault.verify_hmac(b"payload", &tag, Some(b"other-secret")).unwrap());

        let keyed = vault.create_hmac(b"payload", Some(b"shared")).unwrap();
        assert!(vault.verify_hmac(b"payload", &keyed, Some(b"shared")).unwrap());
    }

    #[test]
    fn status_and_audit_never_expose_secrets() {
        let vault = vault(2);
        let blob = vault.encrypt_str("hello-secret").unwrap();
        vault.decrypt(&blob).unwrap();
        vault.rotate_key().unwrap();

        let status = vault.status();
        assert!(status.initialized);
        assert_eq!(status.current_key_version, Some(2));
        assert_eq!(status.retained_key_versions, vec![1]);
        assert!(!status.rotation_due);

        let dump = serde_json::to_string(&vault.audit().recent(100)).unwrap();
        assert!(!dump.contains("hello-secret"));
        assert!(!dump.contains(TEST_KEY_HEX));
        assert_eq!(vault.audit().count(SecurityEventKind::KeyRotated), 1);
    }

    #[test]
    fn shutdown_releases_keys() {
        let vault = vault(3);
        vault.shutdown();
        vault.shutdown();
        assert!(matches!(vault.encrypt_str("x"), Err(VaultError::NotInitialized)));
        assert!(!vault.status().initialized);
        assert_eq!(vault.audit().count(SecurityEventKind::VaultShutdown), 1);
    }

    #[test]
    fn failed_encryption_is_audited() {
        let vault = vault(3);
        vault.shutdown();
        assert!(vault.encrypt(b"payload").is_err());

        let failures = vault.audit().by_kind(SecurityEventKind::EncryptFailed);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].metadata["reason"], "not_initialized");
        assert_eq!(vault.audit().count(SecurityEventKind::Encrypt), 0);
    }

    #[test]
    fn concurrent_encrypts_record_the_version_used() {
        let vault = Arc::new(vault(8));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let vault = Arc::clone(&vault);
                std::thread::spawn(move || {
                    (0..5)
                        .map(|j| {
                            let text = format!("worker-{i}-{j}");
                            (text.clone(), vault.encrypt_str(&text).unwrap())
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for _ in 0..3 {
            vault.rotate_key().unwrap();
        }

        for handle in handles {
            for (text, blob) in handle.join().expect("worker should finish") {
                assert!(blob.key_version <= 4);
                assert_eq!(vault.decrypt_to_string(&blob).unwrap().as_str(), text);
            }
        }
    }
}
