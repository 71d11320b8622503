//! Bounded, append-only log of security-relevant events shared by the vault and
//! the connection registry. Events carry a type and non-sensitive metadata
//! only; plaintext, keys and credentials never reach this module.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_AUDIT_CAPACITY: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    VaultInitialized,
    VaultShutdown,
    Encrypt,
    EncryptFailed,
    Decrypt,
    DecryptFailed,
    KeyRotated,
    Reencrypt,
    PasswordHashed,
    PasswordVerified,
    HmacCreated,
    HmacVerified,
    ConnectionCreated,
    ConnectionRejected,
    ConnectionRemoved,
    HealthCheckFailed,
    ReconnectSucceeded,
    ReconnectExhausted,
    RegistryShutdown,
}

impl SecurityEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventKind::VaultInitialized => "vault_initialized",
            SecurityEventKind::VaultShutdown => "vault_shutdown",
            SecurityEventKind::Encrypt => "encrypt",
            SecurityEventKind::EncryptFailed => "encrypt_failed",
            SecurityEventKind::Decrypt => "decrypt",
            SecurityEventKind::DecryptFailed => "decrypt_failed",
            SecurityEventKind::KeyRotated => "key_rotated",
            SecurityEventKind::Reencrypt => "reencrypt",
            SecurityEventKind::PasswordHashed => "password_hashed",
            SecurityEventKind::PasswordVerified => "password_verified",
            SecurityEventKind::HmacCreated => "hmac_created",
            SecurityEventKind::HmacVerified => "hmac_verified",
            SecurityEventKind::ConnectionCreated => "connection_created",
            SecurityEventKind::ConnectionRejected => "connection_rejected",
            SecurityEventKind::ConnectionRemoved => "connection_removed",
            SecurityEventKind::HealthCheckFailed => "health_check_failed",
            SecurityEventKind::ReconnectSucceeded => "reconnect_succeeded",
            SecurityEventKind::ReconnectExhausted => "reconnect_exhausted",
            SecurityEventKind::RegistryShutdown => "registry_shutdown",
        }
    }
}

impl fmt::Display for SecurityEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: SecurityEventKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Ring buffer of the most recent events; the oldest entry is evicted first.
#[derive(Debug)]
pub struct AuditLog {
    events: Mutex<VecDeque<SecurityEvent>>,
    capacity: usize,
    total: AtomicU64,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            total: AtomicU64::new(0),
        }
    }

    /// Appends an event with metadata pairs. Values must already be safe to
    /// persist; callers pass identifiers and counters, never secret material.
    pub fn record<I, K, V>(&self, kind: SecurityEventKind, metadata: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        let event = SecurityEvent {
            timestamp: Utc::now(),
            kind,
            metadata: metadata
                .into_iter()
                .map(|(key, value)| (key.into(), value.to_string()))
                .collect(),
        };

        tracing::debug!(
            target: "vaultline::audit",
            event = %event.kind,
            metadata = ?event.metadata,
            "security event"
        );

        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_kind(&self, kind: SecurityEventKind) {
        self.record(kind, std::iter::empty::<(&str, String)>());
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events ever recorded, including those already evicted.
    pub fn total_recorded(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Up to `limit` most recent events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<SecurityEvent> {
        let events = self.events.lock();
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }

    pub fn by_kind(&self, kind: SecurityEventKind) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.kind == kind)
            .cloned()
            .collect()
    }

    pub fn since(&self, cutoff: DateTime<Utc>) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: SecurityEventKind) -> usize {
        self.events.lock().iter().filter(|event| event.kind == kind).count()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::{AuditLog, SecurityEventKind};

    #[test]
    fn evicts_oldest_first() {
        let log = AuditLog::new(3);
        for i in 0..5 {
            log.record(SecurityEventKind::Encrypt, [("seq", i)]);
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.total_recorded(), 5);
        let seqs: Vec<String> = log
            .recent(10)
            .into_iter()
            .map(|event| event.metadata["seq"].clone())
            .collect();
        assert_eq!(seqs, vec!["2", "3", "4"]);
    }

    #[test]
    fn filters_by_kind_and_limit() {
        let log = AuditLog::default();
        log.record_kind(SecurityEventKind::VaultInitialized);
        log.record(SecurityEventKind::KeyRotated, [("new_version", 2)]);
        log.record(SecurityEventKind::KeyRotated, [("new_version", 3)]);

        assert_eq!(log.count(SecurityEventKind::KeyRotated), 2);
        assert_eq!(log.by_kind(SecurityEventKind::VaultInitialized).len(), 1);
        let last = log.recent(1);
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].metadata["new_version"], "3");
    }

    #[test]
    fn serializes_event_type() {
        let log = AuditLog::new(4);
        log.record(SecurityEventKind::Decrypt, [("key_version", "1")]);
        let json = serde_json::to_value(&log.recent(1)[0]).unwrap();
        assert_eq!(json["type"], "decrypt");
        assert_eq!(json["metadata"]["key_version"], "1");
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let log = AuditLog::new(0);
        log.record_kind(SecurityEventKind::Encrypt);
        log.record_kind(SecurityEventKind::Decrypt);
        assert_eq!(log.capacity(), 1);
        assert_eq!(log.recent(5)[0].kind, SecurityEventKind::Decrypt);
    }
}
