//! Standard database operations served by the worker.
//!
//! Three shapes:
//! - connection lifecycle (`create`, `test`, `changeDatabase`, `clearConnection`)
//!   which mutate the connection state directly
//! - pass-through: check for an active connection, forward to `Connection::invoke`
//! - two-phase queries (`createQuery`, `executeQuery`, `cancelQuery`)

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::bridge::protocol::QueryId;
use crate::dispatcher::{Handler, HandlerError, HandlerTable, OperationContext};
use crate::driver::{Connection, ConnectionConfig, DriverRegistry, Server};
use crate::state::{PendingQuery, lock_state};

/// Catalog operations forwarded verbatim to the active connection.
pub const PASS_THROUGH_OPERATIONS: &[&str] = &[
    "listDatabases",
    "listSchemas",
    "listTables",
    "listViews",
    "listRoutines",
    "listTableColumns",
    "listTableTriggers",
    "listTableIndexes",
    "getTableReferences",
    "getTableKeys",
    "getTableCreateScript",
    "getViewCreateScript",
    "getRoutineCreateScript",
    "getTableSelectScript",
    "getTableInsertScript",
    "getTableUpdateScript",
    "getTableDeleteScript",
    "getQuerySelectTop",
    "truncateAllTables",
];

/// The handler table the worker binary serves.
pub fn standard_handlers(drivers: DriverRegistry, os_user: Option<String>) -> HandlerTable {
    let opener = Arc::new(ServerOpener { drivers, os_user });

    let builder = HandlerTable::builder()
        .handler(
            "create",
            CreateHandler {
                opener: Arc::clone(&opener),
            },
        )
        .handler("test", TestHandler { opener })
        .handler("changeDatabase", ChangeDatabaseHandler)
        .handler("clearConnection", ClearConnectionHandler)
        .handler("createQuery", CreateQueryHandler)
        .handler("executeQuery", ExecuteQueryHandler)
        .handler("cancelQuery", CancelQueryHandler);

    PASS_THROUGH_OPERATIONS
        .iter()
        .fold(builder, |builder, name| builder.pass_through(name))
        .build()
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, HandlerError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::invalid_args(format!("{key} is required")))
}

fn query_id(args: &Value) -> Result<QueryId, HandlerError> {
    let raw = args
        .get("queryId")
        .and_then(Value::as_str)
        .ok_or(HandlerError::MissingQueryId)?;
    QueryId::parse(raw).map_err(|_| HandlerError::QueryNotFound)
}

struct ServerOpener {
    drivers: DriverRegistry,
    os_user: Option<String>,
}

impl ServerOpener {
    /// Open a server, connect to the configured database and list its tables
    /// as a connectivity probe. The server is disconnected if the probe fails.
    async fn open(
        &self,
        config: &ConnectionConfig,
    ) -> Result<(Arc<dyn Server>, Arc<dyn Connection>), HandlerError> {
        let os_user = self
            .os_user
            .as_deref()
            .ok_or(HandlerError::MissingUsername)?;
        let driver = self.drivers.get(&config.client)?;
        let server = driver.open_server(config, os_user).await?;

        let database = config.database.as_deref().unwrap_or_default();
        let probe = async {
            let connection = server.create_connection(database).await?;
            connection.connect().await?;
            connection.list_tables().await?;
            Ok::<_, HandlerError>(connection)
        };

        match probe.await {
            Ok(connection) => Ok((server, connection)),
            Err(e) => {
                server.disconnect().await;
                Err(e)
            }
        }
    }
}

fn parse_config(args: &Value) -> Result<ConnectionConfig, HandlerError> {
    let raw = args
        .get("config")
        .cloned()
        .ok_or_else(|| HandlerError::invalid_args("config is required"))?;
    serde_json::from_value(raw)
        .map_err(|e| HandlerError::invalid_args(format!("invalid config: {e}")))
}

pub struct CreateHandler {
    opener: Arc<ServerOpener>,
}

#[async_trait]
impl Handler for CreateHandler {
    async fn handle(&self, ctx: &OperationContext, args: Value) -> Result<Value, HandlerError> {
        let config = parse_config(&args)?;
        let (server, connection) = self.opener.open(&config).await?;
        let database = connection.database().to_string();

        let previous = {
            let mut state = lock_state(&ctx.state);
            let previous = state.replace_server(server, config);
            state.select(database.clone(), connection);
            previous
        };
        if let Some(previous) = previous {
            previous.disconnect().await;
        }

        tracing::info!(session_id = %ctx.session_id, %database, "Connection created");
        Ok(Value::Null)
    }
}

pub struct TestHandler {
    opener: Arc<ServerOpener>,
}

#[async_trait]
impl Handler for TestHandler {
    async fn handle(&self, _ctx: &OperationContext, args: Value) -> Result<Value, HandlerError> {
        let config = parse_config(&args)?;
        let (server, _connection) = self.opener.open(&config).await?;
        server.disconnect().await;
        Ok(Value::Null)
    }
}

pub struct ChangeDatabaseHandler;

#[async_trait]
impl Handler for ChangeDatabaseHandler {
    async fn handle(&self, ctx: &OperationContext, args: Value) -> Result<Value, HandlerError> {
        let database = required_str(&args, "database")?;
        let server = lock_state(&ctx.state)
            .active_server
            .clone()
            .ok_or(HandlerError::NoConnection)?;

        let connection = match server.connection(database) {
            Some(existing) => existing,
            None => {
                let created = server.create_connection(database).await?;
                created.connect().await?;
                created
            }
        };

        let mut state = lock_state(&ctx.state);
        let still_active = state
            .active_server
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, &server));
        if !still_active {
            // Replaced or cleared while the connection was being opened.
            return Err(HandlerError::NoConnection);
        }
        state.select(database, connection);
        Ok(Value::Null)
    }
}

pub struct ClearConnectionHandler;

#[async_trait]
impl Handler for ClearConnectionHandler {
    async fn handle(&self, ctx: &OperationContext, _args: Value) -> Result<Value, HandlerError> {
        lock_state(&ctx.state).clear_connection();
        Ok(Value::Null)
    }
}

/// Forwards `(operation, args)` to the active connection and returns its result unmodified.
pub struct PassThrough {
    operation: String,
}

impl PassThrough {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
        }
    }
}

#[async_trait]
impl Handler for PassThrough {
    async fn handle(&self, ctx: &OperationContext, args: Value) -> Result<Value, HandlerError> {
        let active = ctx.active_connection()?;
        let _serialized = ctx.serialize(&active).await;
        Ok(active.connection.invoke(&self.operation, args).await?)
    }
}

pub struct CreateQueryHandler;

#[async_trait]
impl Handler for CreateQueryHandler {
    async fn handle(&self, ctx: &OperationContext, args: Value) -> Result<Value, HandlerError> {
        let text = required_str(&args, "query")?;
        let options = args.get("options").cloned().unwrap_or(Value::Null);
        let active = ctx.active_connection()?;

        let query = active.connection.create_query(text, &options)?;
        let query_id = QueryId::new();
        lock_state(&ctx.state).pending_queries.insert(
            query_id,
            PendingQuery {
                query,
                connection: active,
            },
        );

        tracing::debug!(session_id = %ctx.session_id, %query_id, "Query created");
        Ok(json!({ "queryId": query_id }))
    }
}

pub struct ExecuteQueryHandler;

#[async_trait]
impl Handler for ExecuteQueryHandler {
    async fn handle(&self, ctx: &OperationContext, args: Value) -> Result<Value, HandlerError> {
        let query_id = query_id(&args)?;
        let pending = lock_state(&ctx.state)
            .pending_queries
            .get(&query_id)
            .cloned()
            .ok_or(HandlerError::QueryNotFound)?;

        let result = {
            let _serialized = ctx.serialize(&pending.connection).await;
            pending.query.execute().await
        };

        lock_state(&ctx.state).pending_queries.remove(&query_id);
        Ok(result?)
    }
}

pub struct CancelQueryHandler;

#[async_trait]
impl Handler for CancelQueryHandler {
    async fn handle(&self, ctx: &OperationContext, args: Value) -> Result<Value, HandlerError> {
        let query_id = query_id(&args)?;
        let pending = lock_state(&ctx.state)
            .pending_queries
            .get(&query_id)
            .cloned()
            .ok_or(HandlerError::QueryNotFound)?;

        let result = pending.query.cancel().await;
        lock_state(&ctx.state).pending_queries.remove(&query_id);

        tracing::debug!(session_id = %ctx.session_id, %query_id, ok = result.is_ok(), "Query canceled");
        result?;
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{ReplyFrame, RequestFrame, RequestId, SessionId};
    use crate::dispatcher::{Dispatcher, DispatcherConfig, PushSender};
    use crate::driver::DriverError;
    use crate::memory::{self, MemoryDriver};
    use crate::state::StateScope;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn drivers() -> DriverRegistry {
        DriverRegistry::new().with_driver(
            memory::CLIENT_NAME,
            Arc::new(
                MemoryDriver::new()
                    .with_database("app", ["users", "orders"])
                    .with_database("audit", ["events"]),
            ),
        )
    }

    fn dispatcher(config: DispatcherConfig) -> Arc<Dispatcher> {
        Dispatcher::new(standard_handlers(drivers(), Some("alice".into())), config)
    }

    async fn call(
        dispatcher: &Dispatcher,
        session_id: SessionId,
        name: &str,
        args: Value,
    ) -> Result<Value, String> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let frame = RequestFrame {
            id: RequestId::new(),
            name: name.to_string(),
            args,
        };
        match dispatcher
            .run_operation(session_id, frame, PushSender::new(tx))
            .await
        {
            ReplyFrame::Reply { data, .. } => Ok(data),
            ReplyFrame::Error { error, .. } => Err(error),
        }
    }

    async fn connect(dispatcher: &Dispatcher, session_id: SessionId) {
        call(
            dispatcher,
            session_id,
            "create",
            json!({"config": {"client": "memory", "database": "app"}}),
        )
        .await
        .unwrap();
    }

    #[test]
    fn standard_table_registers_every_operation() {
        let table = standard_handlers(drivers(), None);
        for name in [
            "create",
            "test",
            "changeDatabase",
            "clearConnection",
            "createQuery",
            "executeQuery",
            "cancelQuery",
        ]
        .iter()
        .chain(PASS_THROUGH_OPERATIONS)
        {
            assert!(table.contains(name), "missing {name}");
        }
    }

    #[tokio::test]
    async fn pass_through_requires_a_connection() {
        let dispatcher = dispatcher(DispatcherConfig::default());
        let err = call(&dispatcher, SessionId::new(), "listTables", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, "No database connection found");
    }

    #[tokio::test]
    async fn create_then_pass_through() {
        let dispatcher = dispatcher(DispatcherConfig::default());
        let session_id = SessionId::new();
        connect(&dispatcher, session_id).await;

        let tables = call(&dispatcher, session_id, "listTables", json!({}))
            .await
            .unwrap();
        assert_eq!(tables, json!([{"name": "users"}, {"name": "orders"}]));

        let script = call(
            &dispatcher,
            session_id,
            "getTableSelectScript",
            json!({"table": "users"}),
        )
        .await
        .unwrap();
        assert_eq!(script, json!("SELECT * FROM users;"));
    }

    #[tokio::test]
    async fn create_without_os_user_fails() {
        let dispatcher = Dispatcher::new(
            standard_handlers(drivers(), None),
            DispatcherConfig::default(),
        );
        let err = call(
            &dispatcher,
            SessionId::new(),
            "create",
            json!({"config": {"client": "memory", "database": "app"}}),
        )
        .await
        .unwrap_err();
        assert_eq!(err, "Could not determine OS user name");
    }

    #[tokio::test]
    async fn test_probe_leaves_state_untouched() {
        let dispatcher = dispatcher(DispatcherConfig::default());
        let session_id = SessionId::new();
        call(
            &dispatcher,
            session_id,
            "test",
            json!({"config": {"client": "memory", "database": "app"}}),
        )
        .await
        .unwrap();

        let state = dispatcher.states().for_session(session_id);
        assert!(!lock_state(&state).is_connected());
    }

    #[tokio::test]
    async fn unknown_database_fails_create() {
        let dispatcher = dispatcher(DispatcherConfig::default());
        let err = call(
            &dispatcher,
            SessionId::new(),
            "create",
            json!({"config": {"client": "memory", "database": "nope"}}),
        )
        .await
        .unwrap_err();
        assert_eq!(err, "database not found: nope");
    }

    #[tokio::test]
    async fn change_database_reuses_open_connection() {
        let dispatcher = dispatcher(DispatcherConfig::default());
        let session_id = SessionId::new();
        connect(&dispatcher, session_id).await;

        call(&dispatcher, session_id, "changeDatabase", json!({"database": "audit"}))
            .await
            .unwrap();
        let tables = call(&dispatcher, session_id, "listTables", json!({}))
            .await
            .unwrap();
        assert_eq!(tables, json!([{"name": "events"}]));

        let state = dispatcher.states().for_session(session_id);
        let first_app = {
            let state = lock_state(&state);
            let server = state.active_server.clone().unwrap();
            server.connection("app").unwrap()
        };
        call(&dispatcher, session_id, "changeDatabase", json!({"database": "app"}))
            .await
            .unwrap();
        let active = lock_state(&state).active_connection.clone().unwrap();
        assert!(Arc::ptr_eq(&active.connection, &first_app));
        assert_eq!(
            lock_state(&state).active_database_name.as_deref(),
            Some("app")
        );
    }

    #[tokio::test]
    async fn change_database_without_server_fails() {
        let dispatcher = dispatcher(DispatcherConfig::default());
        let err = call(
            &dispatcher,
            SessionId::new(),
            "changeDatabase",
            json!({"database": "app"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err, "No database connection found");
    }

    #[tokio::test]
    async fn clear_connection_resets_state() {
        let dispatcher = dispatcher(DispatcherConfig::default());
        let session_id = SessionId::new();
        connect(&dispatcher, session_id).await;

        call(&dispatcher, session_id, "clearConnection", json!({}))
            .await
            .unwrap();
        let err = call(&dispatcher, session_id, "listTables", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, "No database connection found");
    }

    #[tokio::test]
    async fn query_lifecycle() {
        let dispatcher = dispatcher(DispatcherConfig::default());
        let session_id = SessionId::new();
        connect(&dispatcher, session_id).await;

        let created = call(&dispatcher, session_id, "createQuery", json!({"query": "select 1"}))
            .await
            .unwrap();
        let query_id = created["queryId"].clone();

        let result = call(&dispatcher, session_id, "executeQuery", json!({"queryId": query_id}))
            .await
            .unwrap();
        assert_eq!(result[0]["command"], "SELECT");

        let state = dispatcher.states().for_session(session_id);
        assert!(lock_state(&state).pending_queries.is_empty());

        let err = call(&dispatcher, session_id, "executeQuery", json!({"queryId": query_id}))
            .await
            .unwrap_err();
        assert_eq!(err, "Query not found");
    }

    #[tokio::test]
    async fn cancel_removes_query() {
        let dispatcher = dispatcher(DispatcherConfig::default());
        let session_id = SessionId::new();
        connect(&dispatcher, session_id).await;

        let created = call(&dispatcher, session_id, "createQuery", json!({"query": "select 1"}))
            .await
            .unwrap();
        let query_id = created["queryId"].clone();

        call(&dispatcher, session_id, "cancelQuery", json!({"queryId": query_id}))
            .await
            .unwrap();
        let err = call(&dispatcher, session_id, "executeQuery", json!({"queryId": query_id}))
            .await
            .unwrap_err();
        assert_eq!(err, "Query not found");

        let err = call(&dispatcher, session_id, "cancelQuery", json!({"queryId": query_id}))
            .await
            .unwrap_err();
        assert_eq!(err, "Query not found");
    }

    #[tokio::test]
    async fn missing_query_id_is_a_precondition_error() {
        let dispatcher = dispatcher(DispatcherConfig::default());
        let err = call(&dispatcher, SessionId::new(), "executeQuery", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, "Query id is required");
    }

    #[tokio::test]
    async fn cancel_reaches_running_query() {
        let dispatcher = dispatcher(DispatcherConfig::default());
        let session_id = SessionId::new();
        connect(&dispatcher, session_id).await;

        let created = call(
            &dispatcher,
            session_id,
            "createQuery",
            json!({"query": "select pg_sleep(60)", "options": {"delayMs": 60_000}}),
        )
        .await
        .unwrap();
        let query_id = created["queryId"].clone();

        let running = {
            let dispatcher = Arc::clone(&dispatcher);
            let query_id = query_id.clone();
            tokio::spawn(async move {
                call(&dispatcher, session_id, "executeQuery", json!({"queryId": query_id})).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        call(&dispatcher, session_id, "cancelQuery", json!({"queryId": query_id}))
            .await
            .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("execute should finish once canceled")
            .unwrap()
            .unwrap_err();
        assert_eq!(err, DriverError::Canceled.to_string());
    }

    async fn start_slow_query(
        dispatcher: &Arc<Dispatcher>,
        session_id: SessionId,
        delay_ms: u64,
    ) -> (Value, tokio::task::JoinHandle<Result<Value, String>>) {
        let created = call(
            dispatcher,
            session_id,
            "createQuery",
            json!({"query": "select pg_sleep(1)", "options": {"delayMs": delay_ms}}),
        )
        .await
        .unwrap();
        let query_id = created["queryId"].clone();
        let running = {
            let dispatcher = Arc::clone(dispatcher);
            let query_id = query_id.clone();
            tokio::spawn(async move {
                call(&dispatcher, session_id, "executeQuery", json!({"queryId": query_id})).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        (query_id, running)
    }

    #[tokio::test]
    async fn running_query_does_not_block_other_database() {
        let dispatcher = dispatcher(DispatcherConfig::default());
        let session_id = SessionId::new();
        connect(&dispatcher, session_id).await;

        let (query_id, running) = start_slow_query(&dispatcher, session_id, 60_000).await;
        call(&dispatcher, session_id, "changeDatabase", json!({"database": "audit"}))
            .await
            .unwrap();

        let tables = tokio::time::timeout(
            Duration::from_secs(1),
            call(&dispatcher, session_id, "listTables", json!({})),
        )
        .await
        .expect("audit must not wait for a query on app")
        .unwrap();
        assert_eq!(tables, json!([{"name": "events"}]));

        call(&dispatcher, session_id, "cancelQuery", json!({"queryId": query_id}))
            .await
            .unwrap();
        assert!(running.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn reselected_connection_stays_serialized() {
        let dispatcher = dispatcher(DispatcherConfig::default());
        let session_id = SessionId::new();
        connect(&dispatcher, session_id).await;
        call(&dispatcher, session_id, "changeDatabase", json!({"database": "audit"}))
            .await
            .unwrap();

        let (query_id, running) = start_slow_query(&dispatcher, session_id, 60_000).await;
        for database in ["app", "audit"] {
            call(&dispatcher, session_id, "changeDatabase", json!({"database": database}))
                .await
                .unwrap();
        }

        let waited = tokio::time::timeout(
            Duration::from_millis(100),
            call(&dispatcher, session_id, "listTables", json!({})),
        )
        .await;
        assert!(waited.is_err(), "listTables ran alongside the query on audit");

        call(&dispatcher, session_id, "cancelQuery", json!({"queryId": query_id}))
            .await
            .unwrap();
        assert!(running.await.unwrap().is_err());
        let tables = call(&dispatcher, session_id, "listTables", json!({}))
            .await
            .unwrap();
        assert_eq!(tables, json!([{"name": "events"}]));
    }

    #[tokio::test]
    async fn unserialized_connection_runs_alongside_query() {
        let dispatcher = dispatcher(DispatcherConfig::default().with_serialized_operations(false));
        let session_id = SessionId::new();
        connect(&dispatcher, session_id).await;

        let (query_id, running) = start_slow_query(&dispatcher, session_id, 60_000).await;
        let tables = tokio::time::timeout(
            Duration::from_secs(1),
            call(&dispatcher, session_id, "listTables", json!({})),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(tables, json!([{"name": "users"}, {"name": "orders"}]));

        call(&dispatcher, session_id, "cancelQuery", json!({"queryId": query_id}))
            .await
            .unwrap();
        assert!(running.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn per_session_scope_isolates_connections() {
        let dispatcher = dispatcher(DispatcherConfig::default().with_scope(StateScope::PerSession));
        let first = SessionId::new();
        let second = SessionId::new();
        connect(&dispatcher, first).await;

        assert!(call(&dispatcher, first, "listTables", json!({})).await.is_ok());
        let err = call(&dispatcher, second, "listTables", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, "No database connection found");
    }

    #[tokio::test]
    async fn shared_scope_shares_the_connection() {
        let dispatcher = dispatcher(DispatcherConfig::default());
        connect(&dispatcher, SessionId::new()).await;
        assert!(
            call(&dispatcher, SessionId::new(), "listTables", json!({}))
                .await
                .is_ok()
        );
    }
}
