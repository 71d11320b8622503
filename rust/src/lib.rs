//! Credential vault and supervised connection registry.
//!
//! [`vault::VaultManager`] owns the master key and seals secrets at rest;
//! [`registry::ConnectionRegistry`] admits connections, decrypts their
//! credentials through the vault and keeps them healthy. Both write to a shared
//! [`audit::AuditLog`] that never holds secret material.

pub mod audit;
pub mod config;
pub mod crypto;
pub mod registry;
pub mod telemetry;
pub mod vault;
