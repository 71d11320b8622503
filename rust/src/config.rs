//! Settings loader. A JSON file supplies the vault, registry and logging
//! settings; every field has a default so an empty object is a valid file.
//! The master key itself is never stored here, only where to find it.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::DEFAULT_AUDIT_CAPACITY;
use crate::crypto::secrets::{CipherAlgorithm, DEFAULT_KDF_ITERATIONS};
use crate::vault::MasterKeySource;

/// Overrides `vault.environment` when set.
pub const ENVIRONMENT_ENV: &str = "VAULTLINE_ENV";
pub const DEFAULT_KEY_ENV: &str = "VAULTLINE_MASTER_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file unreadable: {0}")]
    Io(String),
    #[error("config parse failed: {0}")]
    Parse(String),
    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    #[default]
    Production,
    Development,
    Test,
}

impl RuntimeEnvironment {
    pub fn is_production(&self) -> bool {
        matches!(self, RuntimeEnvironment::Production)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Some(RuntimeEnvironment::Production),
            "development" | "dev" => Some(RuntimeEnvironment::Development),
            "test" => Some(RuntimeEnvironment::Test),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultSettings {
    pub environment: RuntimeEnvironment,
    /// Environment variable holding the hex-encoded 32 byte master key.
    pub key_env: Option<String>,
    /// File holding the hex-encoded master key. Takes precedence over `key_env`.
    pub key_path: Option<PathBuf>,
    pub algorithm: CipherAlgorithm,
    /// PBKDF2 rounds for subkeys and password hashes. Must stay fixed for the
    /// lifetime of the stored blobs, since blobs do not record it.
    pub kdf_iterations: u32,
    pub max_retained_keys: usize,
    pub rotation_interval_days: u32,
    pub audit_capacity: usize,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            environment: RuntimeEnvironment::default(),
            key_env: Some(DEFAULT_KEY_ENV.to_string()),
            key_path: None,
            algorithm: CipherAlgorithm::default(),
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            max_retained_keys: 3,
            rotation_interval_days: 90,
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
        }
    }
}

impl VaultSettings {
    /// Where the master key should be loaded from.
    pub fn key_source(&self) -> MasterKeySource {
        if let Some(path) = &self.key_path {
            return MasterKeySource::File(path.clone());
        }
        match &self.key_env {
            Some(var) => MasterKeySource::EnvVar(var.clone()),
            None => MasterKeySource::Unset,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub max_connections: usize,
    pub health_check_interval_ms: u64,
    pub auto_reconnect: bool,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub event_capacity: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_connections: 50,
            health_check_interval_ms: 30_000,
            auto_reconnect: true,
            max_retries: 3,
            base_delay_ms: 1_000,
            event_capacity: 256,
        }
    }
}

impl RegistrySettings {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive, e.g. `info,vaultline::registry=debug`.
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub vault: VaultSettings,
    pub registry: RegistrySettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Reads and validates a JSON settings file, then applies environment
    /// overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw_json = fs::read_to_string(&path).map_err(|e| ConfigError::Io(format!("{e}")))?;
        let mut settings: Settings =
            serde_json::from_str(&raw_json).map_err(|e| ConfigError::Parse(format!("{e}")))?;
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Settings::default();
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = std::env::var(ENVIRONMENT_ENV) {
            self.vault.environment = RuntimeEnvironment::parse(&value).ok_or_else(|| {
                ConfigError::Invalid(format!("{ENVIRONMENT_ENV} has unknown value {value:?}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vault.kdf_iterations == 0 {
            return Err(ConfigError::Invalid("vault.kdf_iterations must be positive".into()));
        }
        if self.vault.environment.is_production() && self.vault.kdf_iterations < DEFAULT_KDF_ITERATIONS {
            return Err(ConfigError::Invalid(format!(
                "vault.kdf_iterations below {DEFAULT_KDF_ITERATIONS} is not allowed in production"
            )));
        }
        if self.registry.max_connections == 0 {
            return Err(ConfigError::Invalid("registry.max_connections must be positive".into()));
        }
        if self.registry.health_check_interval_ms < 1_000 {
            return Err(ConfigError::Invalid(
                "registry.health_check_interval_ms must be at least 1000".into(),
            ));
        }
        if self.registry.event_capacity == 0 {
            return Err(ConfigError::Invalid("registry.event_capacity must be positive".into()));
        }
        Ok(())
    }
}
