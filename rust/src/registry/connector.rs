//! The capability every backend implements, and the factory that picks an
//! implementation by connection type. Protocol clients live outside this crate;
//! the only built-in connector is a plain TCP reachability probe.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;

use crate::registry::types::{ConnectionConfig, ConnectionType, Credentials};

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("no connector available for {0}")]
    Unsupported(String),
    #[error("health check failed: {0}")]
    HealthCheck(String),
    #[error("disconnect failed: {0}")]
    Disconnect(String),
}

/// Minimal server information returned by a successful connect.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectResult {
    pub server_version: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<ConnectResult, ConnectorError>;

    /// `Ok(false)` means reachable but reporting itself unhealthy.
    async fn health_check(&self) -> Result<bool, ConnectorError>;

    async fn disconnect(&self) -> Result<(), ConnectorError>;
}

pub trait ConnectorFactory: Send + Sync {
    fn create(
        &self,
        connection_type: ConnectionType,
        config: &ConnectionConfig,
        credentials: Credentials,
    ) -> Result<Arc<dyn Connector>, ConnectorError>;
}

type Builder =
    Box<dyn Fn(&ConnectionConfig, Credentials) -> Result<Arc<dyn Connector>, ConnectorError> + Send + Sync>;

/// Factory keyed by [`ConnectionType`]. New backends register a builder
/// instead of adding branches to the registry.
#[derive(Default)]
pub struct ConnectorCatalog {
    builders: HashMap<ConnectionType, Builder>,
}

impl ConnectorCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog that answers every connection type with a [`TcpProbeConnector`].
    pub fn tcp_probes() -> Self {
        let mut catalog = Self::new();
        for connection_type in ConnectionType::ALL {
            catalog.register(connection_type, |config, _credentials| {
                Ok(Arc::new(TcpProbeConnector::from_config(config)?) as Arc<dyn Connector>)
            });
        }
        catalog
    }

    pub fn register<F>(&mut self, connection_type: ConnectionType, builder: F) -> &mut Self
    where
        F: Fn(&ConnectionConfig, Credentials) -> Result<Arc<dyn Connector>, ConnectorError> + Send + Sync + 'static,
    {
        self.builders.insert(connection_type, Box::new(builder));
        self
    }

    pub fn supports(&self, connection_type: ConnectionType) -> bool {
        self.builders.contains_key(&connection_type)
    }
}

impl ConnectorFactory for ConnectorCatalog {
    fn create(
        &self,
        connection_type: ConnectionType,
        config: &ConnectionConfig,
        credentials: Credentials,
    ) -> Result<Arc<dyn Connector>, ConnectorError> {
        let builder = self
            .builders
            .get(&connection_type)
            .ok_or_else(|| ConnectorError::Unsupported(connection_type.to_string()))?;
        builder(config, credentials)
    }
}

/// Opens and immediately drops a TCP connection. Says nothing about the
/// protocol spoken on the other end.
#[derive(Debug, Clone)]
pub struct TcpProbeConnector {
    host: String,
    port: u16,
}

impl TcpProbeConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Result<Self, ConnectorError> {
        let port = u16::try_from(config.port)
            .map_err(|_| ConnectorError::ConnectFailed(format!("port {} out of range", config.port)))?;
        Ok(Self::new(config.host.clone(), port))
    }

    async fn dial(&self) -> std::io::Result<TcpStream> {
        TcpStream::connect((self.host.as_str(), self.port)).await
    }
}

#[async_trait]
impl Connector for TcpProbeConnector {
    async fn connect(&self) -> Result<ConnectResult, ConnectorError> {
        let stream = self
            .dial()
            .await
            .map_err(|e| ConnectorError::ConnectFailed(format!("{e}")))?;
        let mut metadata = BTreeMap::new();
        if let Ok(peer) = stream.peer_addr() {
            metadata.insert("peer".to_string(), peer.to_string());
        }
        Ok(ConnectResult {
            server_version: None,
            metadata,
        })
    }

    async fn health_check(&self) -> Result<bool, ConnectorError> {
        self.dial()
            .await
            .map(|_| true)
            .map_err(|e| ConnectorError::HealthCheck(format!("{e}")))
    }

    async fn disconnect(&self) -> Result<(), ConnectorError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Connector, ConnectorCatalog, ConnectorError, ConnectorFactory, TcpProbeConnector};
    use crate::registry::types::{ConnectionConfig, ConnectionType, Credentials};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn probes_a_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind should work");
        let port = listener.local_addr().unwrap().port();

        let probe = TcpProbeConnector::new("127.0.0.1", port);
        let result = probe.connect().await.expect("connect should succeed");
        assert!(result.metadata["peer"].ends_with(&format!(":{port}")));
        assert!(probe.health_check().await.unwrap());
        probe.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn reports_refused_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = TcpProbeConnector::new("127.0.0.1", port);
        assert!(matches!(probe.connect().await, Err(ConnectorError::ConnectFailed(_))));
        assert!(matches!(probe.health_check().await, Err(ConnectorError::HealthCheck(_))));
    }

    #[test]
    fn catalog_rejects_unregistered_types() {
        let catalog = ConnectorCatalog::new();
        let config = ConnectionConfig::new("db", ConnectionType::Redis, "localhost", 6379);
        let result = catalog.create(ConnectionType::Redis, &config, Credentials::new("", None));
        assert!(matches!(result, Err(ConnectorError::Unsupported(_))));

        let probes = ConnectorCatalog::tcp_probes();
        assert!(ConnectionType::ALL.iter().all(|t| probes.supports(*t)));
        assert!(probes
            .create(ConnectionType::Redis, &config, Credentials::new("", None))
            .is_ok());
    }
}
