use thiserror::Error;

use crate::crypto::secrets::VaultError;
use crate::registry::connector::ConnectorError;
use crate::registry::store::StoreError;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("connection limit of {limit} reached")]
    CapacityExceeded { limit: usize },
    #[error("connector error for {connection}: {source}")]
    Connector {
        connection: String,
        #[source]
        source: ConnectorError,
    },
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),
    #[error("unknown connection {0}")]
    NotFound(String),
    #[error("registry is shutting down")]
    ShuttingDown,
    #[error("config store error: {0}")]
    Store(#[from] StoreError),
    #[error("background task failed: {0}")]
    Task(String),
}

impl RegistryError {
    /// Validation and capacity errors will fail the same way on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::Connector { .. })
    }
}
