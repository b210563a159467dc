//! In-memory database driver (`client: "memory"`).
//!
//! Holds a fixed catalog of databases and tables. It ships with the worker so
//! the transport can be exercised end to end without a database server.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::driver::{
    CancelableQuery, Connection, ConnectionConfig, Driver, DriverError, Server,
};

pub const CLIENT_NAME: &str = "memory";

const DEFAULT_DATABASE: &str = "main";

type Catalog = BTreeMap<String, Vec<String>>;

#[derive(Clone, Default)]
pub struct MemoryDriver {
    catalog: Catalog,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database<I, S>(mut self, name: impl Into<String>, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.catalog
            .insert(name.into(), tables.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn open_server(
        &self,
        config: &ConnectionConfig,
        os_user: &str,
    ) -> Result<Arc<dyn Server>, DriverError> {
        let user = config
            .options
            .get("user")
            .and_then(Value::as_str)
            .unwrap_or(os_user)
            .to_string();
        tracing::debug!(%user, databases = self.catalog.len(), "Opening memory server");
        Ok(Arc::new(MemoryServer {
            catalog: Arc::new(self.catalog.clone()),
            connections: StdMutex::new(BTreeMap::new()),
        }))
    }
}

pub struct MemoryServer {
    catalog: Arc<Catalog>,
    connections: StdMutex<BTreeMap<String, Arc<MemoryConnection>>>,
}

impl MemoryServer {
    fn connections(&self) -> MutexGuard<'_, BTreeMap<String, Arc<MemoryConnection>>> {
        self.connections.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Memory server connection table poisoned - recovering");
            poisoned.into_inner()
        })
    }
}

#[async_trait]
impl Server for MemoryServer {
    fn connection(&self, database: &str) -> Option<Arc<dyn Connection>> {
        self.connections()
            .get(database)
            .map(|c| Arc::clone(c) as Arc<dyn Connection>)
    }

    async fn create_connection(&self, database: &str) -> Result<Arc<dyn Connection>, DriverError> {
        let database = if database.is_empty() {
            DEFAULT_DATABASE
        } else {
            database
        };
        if !self.catalog.contains_key(database) {
            return Err(DriverError::DatabaseNotFound(database.to_string()));
        }

        let conn = Arc::new(MemoryConnection {
            database: database.to_string(),
            catalog: Arc::clone(&self.catalog),
            connected: AtomicBool::new(false),
        });
        self.connections()
            .insert(database.to_string(), Arc::clone(&conn));
        Ok(conn)
    }

    async fn disconnect(&self) {
        let drained: Vec<_> = std::mem::take(&mut *self.connections())
            .into_values()
            .collect();
        for conn in drained {
            conn.disconnect().await;
        }
    }
}

pub struct MemoryConnection {
    database: String,
    catalog: Arc<Catalog>,
    connected: AtomicBool,
}

impl MemoryConnection {
    fn ensure_connected(&self) -> Result<(), DriverError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(DriverError::NotConnected)
        }
    }

    fn tables(&self) -> &[String] {
        self.catalog
            .get(&self.database)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn database(&self) -> &str {
        &self.database
    }

    async fn connect(&self) -> Result<(), DriverError> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn list_tables(&self) -> Result<Value, DriverError> {
        self.ensure_connected()?;
        Ok(json!(
            self.tables()
                .iter()
                .map(|name| json!({ "name": name }))
                .collect::<Vec<_>>()
        ))
    }

    fn create_query(
        &self,
        text: &str,
        options: &Value,
    ) -> Result<Arc<dyn CancelableQuery>, DriverError> {
        self.ensure_connected()?;
        let delay = options
            .get("delayMs")
            .and_then(Value::as_u64)
            .map(Duration::from_millis);
        Ok(Arc::new(MemoryQuery {
            text: text.to_string(),
            delay,
            cancel: CancellationToken::new(),
        }))
    }

    async fn invoke(&self, operation: &str, args: Value) -> Result<Value, DriverError> {
        self.ensure_connected()?;
        match operation {
            "listDatabases" => Ok(json!(self.catalog.keys().collect::<Vec<_>>())),
            "listSchemas" => Ok(json!(["public"])),
            "listTables" => self.list_tables().await,
            "listViews" | "listRoutines" | "listTableTriggers" | "listTableIndexes" => {
                Ok(json!([]))
            }
            "getTableSelectScript" => {
                let table = args
                    .get("table")
                    .and_then(Value::as_str)
                    .ok_or_else(|| DriverError::failed("table is required"))?;
                if !self.tables().iter().any(|t| t == table) {
                    return Err(DriverError::failed(format!("table not found: {table}")));
                }
                Ok(json!(format!("SELECT * FROM {table};")))
            }
            other => Err(DriverError::Unsupported(other.to_string())),
        }
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }
}

pub struct MemoryQuery {
    text: String,
    delay: Option<Duration>,
    cancel: CancellationToken,
}

#[async_trait]
impl CancelableQuery for MemoryQuery {
    async fn execute(&self) -> Result<Value, DriverError> {
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(DriverError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        } else if self.cancel.is_cancelled() {
            return Err(DriverError::Canceled);
        }

        let command = self
            .text
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_uppercase();
        Ok(json!([{ "command": command, "rows": [], "rowCount": 0 }]))
    }

    async fn cancel(&self) -> Result<(), DriverError> {
        self.cancel.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConnectionConfig {
        serde_json::from_value(json!({"client": "memory", "database": "app"})).unwrap()
    }

    async fn connected() -> (Arc<dyn Server>, Arc<dyn Connection>) {
        let driver = MemoryDriver::new().with_database("app", ["users", "orders"]);
        let server = driver.open_server(&config(), "alice").await.unwrap();
        let conn = server.create_connection("app").await.unwrap();
        conn.connect().await.unwrap();
        (server, conn)
    }

    #[tokio::test]
    async fn lists_tables_once_connected() {
        let (_server, conn) = connected().await;
        let tables = conn.list_tables().await.unwrap();
        assert_eq!(tables, json!([{"name": "users"}, {"name": "orders"}]));
    }

    #[tokio::test]
    async fn server_remembers_connections_per_database() {
        let (server, conn) = connected().await;
        let again = server.connection("app").unwrap();
        assert_eq!(again.database(), conn.database());
        assert!(server.connection("other").is_none());
    }

    #[tokio::test]
    async fn unknown_database_fails() {
        let driver = MemoryDriver::new().with_database("app", ["users"]);
        let server = driver.open_server(&config(), "alice").await.unwrap();
        let err = server.create_connection("missing").await.err().unwrap();
        assert!(matches!(err, DriverError::DatabaseNotFound(_)));
    }

    #[tokio::test]
    async fn disconnect_closes_connections() {
        let (server, conn) = connected().await;
        server.disconnect().await;
        assert!(matches!(
            conn.list_tables().await,
            Err(DriverError::NotConnected)
        ));
        assert!(server.connection("app").is_none());
    }

    #[tokio::test]
    async fn poisoned_connection_table_still_answers() {
        let driver = MemoryDriver::new().with_database("app", ["users"]);
        let server = Arc::new(MemoryServer {
            catalog: Arc::new(driver.catalog.clone()),
            connections: StdMutex::new(BTreeMap::new()),
        });
        server.create_connection("app").await.unwrap();

        let poisoner = Arc::clone(&server);
        std::thread::spawn(move || {
            let _guard = poisoner.connections.lock().unwrap();
            panic!("handler panicked while holding the table");
        })
        .join()
        .unwrap_err();
        assert!(server.connections.is_poisoned());

        assert_eq!(server.connection("app").unwrap().database(), "app");
        server.disconnect().await;
        assert!(server.connection("app").is_none());
    }

    #[tokio::test]
    async fn cancel_interrupts_delayed_query() {
        let (_server, conn) = connected().await;
        let query = conn
            .create_query("select pg_sleep(60)", &json!({"delayMs": 60_000}))
            .unwrap();

        let running = {
            let query = Arc::clone(&query);
            tokio::spawn(async move { query.execute().await })
        };
        tokio::task::yield_now().await;
        query.cancel().await.unwrap();

        let result = running.await.unwrap();
        assert!(matches!(result, Err(DriverError::Canceled)));
    }

    #[tokio::test]
    async fn query_reports_command() {
        let (_server, conn) = connected().await;
        let query = conn.create_query("select 1", &Value::Null).unwrap();
        let result = query.execute().await.unwrap();
        assert_eq!(result[0]["command"], "SELECT");
    }

    #[tokio::test]
    async fn unsupported_operation_is_reported() {
        let (_server, conn) = connected().await;
        let err = conn.invoke("truncateAllTables", json!({})).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "operation not supported by this driver: truncateAllTables"
        );
    }
}
