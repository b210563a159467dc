//! Database driver seam.
//!
//! The worker never talks to a database directly: handlers go through these
//! traits, and the concrete drivers are registered by name at process start.
//! Everything behind a `Connection` is opaque to the transport.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("unknown database client: {0}")]
    UnknownClient(String),

    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    #[error("operation not supported by this driver: {0}")]
    Unsupported(String),

    #[error("not connected")]
    NotConnected,

    #[error("query canceled")]
    Canceled,

    #[error("{message}")]
    Failed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl DriverError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Failed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Connection settings as supplied by the client. Only `client` and
/// `database` are interpreted here; the rest is handed to the driver as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub client: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

/// Opens servers for one kind of database.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    async fn open_server(
        &self,
        config: &ConnectionConfig,
        os_user: &str,
    ) -> Result<Arc<dyn Server>, DriverError>;
}

/// A database server, holding at most one open connection per database.
#[async_trait]
pub trait Server: Send + Sync + 'static {
    /// Connection already opened for `database`, if any.
    fn connection(&self, database: &str) -> Option<Arc<dyn Connection>>;

    /// Create (but do not connect) a connection for `database` and remember it.
    async fn create_connection(&self, database: &str) -> Result<Arc<dyn Connection>, DriverError>;

    /// Close every connection of this server.
    async fn disconnect(&self);
}

#[async_trait]
pub trait Connection: Send + Sync + 'static {
    fn database(&self) -> &str;

    async fn connect(&self) -> Result<(), DriverError>;

    async fn list_tables(&self) -> Result<serde_json::Value, DriverError>;

    /// Parse a query without running it.
    fn create_query(
        &self,
        text: &str,
        options: &serde_json::Value,
    ) -> Result<Arc<dyn CancelableQuery>, DriverError>;

    /// Generic entry point for pass-through operations, keyed by operation name.
    async fn invoke(
        &self,
        operation: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, DriverError>;

    async fn disconnect(&self);
}

/// Two-phase query handle: created once, then executed or canceled.
#[async_trait]
pub trait CancelableQuery: Send + Sync + 'static {
    async fn execute(&self) -> Result<serde_json::Value, DriverError>;

    async fn cancel(&self) -> Result<(), DriverError>;
}

/// Drivers keyed by `ConnectionConfig::client`. Built once at worker start.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_driver(mut self, client: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
        self.drivers.insert(client.into(), driver);
        self
    }

    pub fn get(&self, client: &str) -> Result<&Arc<dyn Driver>, DriverError> {
        self.drivers
            .get(client)
            .ok_or_else(|| DriverError::UnknownClient(client.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_keeps_driver_options() {
        let config: ConnectionConfig = serde_json::from_value(json!({
            "client": "memory",
            "database": "app",
            "host": "localhost",
            "port": 5432,
        }))
        .unwrap();

        assert_eq!(config.client, "memory");
        assert_eq!(config.database.as_deref(), Some("app"));
        assert_eq!(config.options.get("port"), Some(&json!(5432)));
    }

    #[test]
    fn unknown_client_is_an_error() {
        let registry = DriverRegistry::new();
        let err = registry.get("oracle").err().unwrap();
        assert_eq!(err.to_string(), "unknown database client: oracle");
    }

    #[test]
    fn failed_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = DriverError::with_source("could not reach server", io);
        assert_eq!(err.to_string(), "could not reach server");
        assert!(std::error::Error::source(&err).is_some());
    }
}
