//! Connection configuration and the read-only views the registry hands out.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::secrets::EncryptedBlob;
use crate::registry::error::RegistryError;
use crate::registry::state::ConnectionStatus;

pub const MIN_TIMEOUT_MS: u64 = 1_000;

/// Backend families a connector can be registered for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionType {
    Postgresql,
    Mysql,
    Mongodb,
    Redis,
    Rest,
    Tcp,
}

impl ConnectionType {
    pub const ALL: [ConnectionType; 6] = [
        ConnectionType::Postgresql,
        ConnectionType::Mysql,
        ConnectionType::Mongodb,
        ConnectionType::Redis,
        ConnectionType::Rest,
        ConnectionType::Tcp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Postgresql => "POSTGRESQL",
            ConnectionType::Mysql => "MYSQL",
            ConnectionType::Mongodb => "MONGODB",
            ConnectionType::Redis => "REDIS",
            ConnectionType::Rest => "REST",
            ConnectionType::Tcp => "TCP",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionType {
    type Err = RegistryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "POSTGRESQL" | "POSTGRES" => Ok(ConnectionType::Postgresql),
            "MYSQL" => Ok(ConnectionType::Mysql),
            "MONGODB" => Ok(ConnectionType::Mongodb),
            "REDIS" => Ok(ConnectionType::Redis),
            "REST" => Ok(ConnectionType::Rest),
            "TCP" => Ok(ConnectionType::Tcp),
            _ => Err(RegistryError::Validation(format!(
                "unsupported connection type {value:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionTimeouts {
    pub connect_ms: u64,
    pub health_check_ms: u64,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            connect_ms: 10_000,
            health_check_ms: 5_000,
        }
    }
}

fn default_pool_size() -> u32 {
    10
}

/// What a caller asks the registry to connect to. Credentials only ever travel
/// in encrypted form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Generated when empty.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub connection_type: String,
    #[serde(default)]
    pub host: String,
    /// Wider than `u16` so out-of-range input reaches validation.
    #[serde(default)]
    pub port: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default, rename = "credentialsRef", skip_serializing_if = "Option::is_none")]
    pub credentials: Option<EncryptedBlob>,
    #[serde(default)]
    pub ssl_enabled: bool,
    #[serde(default)]
    pub timeouts: ConnectionTimeouts,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl ConnectionConfig {
    pub fn new(name: impl Into<String>, connection_type: ConnectionType, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            connection_type: connection_type.as_str().to_string(),
            host: host.into(),
            port: u32::from(port),
            database: None,
            username: String::new(),
            credentials: None,
            ssl_enabled: false,
            timeouts: ConnectionTimeouts::default(),
            pool_size: default_pool_size(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, secret: EncryptedBlob) -> Self {
        self.username = username.into();
        self.credentials = Some(secret);
        self
    }

    pub fn with_timeouts(mut self, timeouts: ConnectionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.connect_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.health_check_ms)
    }

    /// Checks required fields and ranges, returning the parsed backend type.
    pub fn validate(&self) -> Result<ConnectionType, RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::Validation("name is required".into()));
        }
        if self.connection_type.trim().is_empty() {
            return Err(RegistryError::Validation("type is required".into()));
        }
        let connection_type: ConnectionType = self.connection_type.parse()?;
        if self.host.trim().is_empty() {
            return Err(RegistryError::Validation("host is required".into()));
        }
        if !(1..=65_535).contains(&self.port) {
            return Err(RegistryError::Validation(format!(
                "port {} is outside 1..=65535",
                self.port
            )));
        }
        if self.timeouts.connect_ms < MIN_TIMEOUT_MS || self.timeouts.health_check_ms < MIN_TIMEOUT_MS {
            return Err(RegistryError::Validation(format!(
                "timeouts must be at least {MIN_TIMEOUT_MS} ms"
            )));
        }
        if self.pool_size == 0 {
            return Err(RegistryError::Validation("pool size must be positive".into()));
        }
        Ok(connection_type)
    }
}

/// Decrypted credentials handed to a connector. The secret is wiped on drop.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    secret: Option<Zeroizing<String>>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: Option<Zeroizing<String>>) -> Self {
        Self {
            username: username.into(),
            secret,
        }
    }

    pub fn secret(&self) -> Option<&str> {
        self.secret.as_ref().map(|s| s.as_str())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Outcome of a one-off connectivity test.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTestReport {
    pub latency_ms: f64,
    pub server_version: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    pub host: String,
    pub port: u32,
    pub database: Option<String>,
    pub status: ConnectionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub query_count: u64,
    pub error_count: u64,
    pub consecutive_failures: u32,
    pub reconnect_attempts: u32,
    pub avg_response_time_ms: Option<f64>,
    pub last_error: Option<String>,
}

/// Fleet-wide view.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryOverview {
    pub total: usize,
    pub active: usize,
    pub healthy: usize,
    pub errored: usize,
    pub avg_response_time_ms: Option<f64>,
    pub connections: Vec<ConnectionSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub id: String,
    pub status: ConnectionStatus,
    /// `false` when the check did not run because another one was in flight
    /// or the connection was not eligible.
    pub performed: bool,
    pub healthy: bool,
    pub latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub disconnected: usize,
    pub errors: Vec<(String, String)>,
}

/// Emitted for external observability sinks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    Created { id: String, connection_type: ConnectionType },
    StatusChanged { id: String, from: ConnectionStatus, to: ConnectionStatus },
    HealthChecked { id: String, healthy: bool, latency_ms: f64 },
    ReconnectScheduled { id: String, attempt: u32, delay_ms: u64 },
    Reconnected { id: String, attempts: u32 },
    Failed { id: String, attempts: u32 },
    Removed { id: String },
}
