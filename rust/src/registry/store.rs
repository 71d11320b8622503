//! Persistence hooks. The registry calls these but does not implement storage;
//! the hosting process supplies a store that persists configs (with their
//! encrypted credentials) wherever it likes.

use thiserror::Error;

use crate::registry::types::ConnectionConfig;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct StoreError(pub String);

pub trait ConfigStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<ConnectionConfig>, StoreError>;
    fn save(&self, config: &ConnectionConfig) -> Result<(), StoreError>;
    fn remove(&self, id: &str) -> Result<(), StoreError>;
}
