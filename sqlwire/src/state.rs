//! Worker connection state.
//!
//! One `ConnectionState` holds the active server/connection and the pending
//! cancelable queries. Whether there is one for the whole worker or one per
//! session is decided by `StateScope`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use dashmap::DashMap;

use crate::bridge::protocol::{QueryId, SessionId};
use crate::driver::{CancelableQuery, Connection, ConnectionConfig, Server};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StateScope {
    /// One state shared by every session of the worker.
    #[default]
    Shared,
    /// Separate state per session id, created on attach and discarded on close.
    PerSession,
}

/// A connection plus the lock that serializes driver calls on it.
///
/// One per underlying connection: reselecting a database hands back the same
/// value, so the lock follows the connection rather than the selection.
#[derive(Clone)]
pub struct ActiveConnection {
    pub connection: Arc<dyn Connection>,
    ops: Arc<tokio::sync::Mutex<()>>,
}

impl ActiveConnection {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            ops: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Hold while calling into the driver to keep one operation in flight per connection.
    pub async fn lock_ops(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.ops.lock().await
    }

    pub fn same_connection(&self, other: &ActiveConnection) -> bool {
        Arc::ptr_eq(&self.ops, &other.ops)
    }
}

/// A created query and the connection it was created on.
#[derive(Clone)]
pub struct PendingQuery {
    pub query: Arc<dyn CancelableQuery>,
    pub connection: ActiveConnection,
}

#[derive(Default)]
pub struct ConnectionState {
    pub active_server: Option<Arc<dyn Server>>,
    pub active_config: Option<ConnectionConfig>,
    pub active_connection: Option<ActiveConnection>,
    pub active_database_name: Option<String>,
    pub pending_queries: HashMap<QueryId, PendingQuery>,
    /// Connections of `active_server` selected so far, keyed by database.
    opened: HashMap<String, ActiveConnection>,
}

impl ConnectionState {
    pub fn clear_connection(&mut self) {
        self.active_server = None;
        self.active_config = None;
        self.active_connection = None;
        self.active_database_name = None;
        self.opened.clear();
    }

    /// Replace the server, returning the previous one. Connections of the old server are forgotten.
    pub fn replace_server(
        &mut self,
        server: Arc<dyn Server>,
        config: ConnectionConfig,
    ) -> Option<Arc<dyn Server>> {
        let previous = self.active_server.replace(server);
        self.active_config = Some(config);
        self.active_connection = None;
        self.active_database_name = None;
        self.opened.clear();
        previous
    }

    /// Make `connection` the active one under `database_name`.
    pub fn select(
        &mut self,
        database_name: impl Into<String>,
        connection: Arc<dyn Connection>,
    ) -> ActiveConnection {
        let key = connection.database().to_string();
        let active = match self.opened.get(&key) {
            Some(known) if Arc::ptr_eq(&known.connection, &connection) => known.clone(),
            _ => {
                let active = ActiveConnection::new(connection);
                self.opened.insert(key, active.clone());
                active
            }
        };
        self.active_connection = Some(active.clone());
        self.active_database_name = Some(database_name.into());
        active
    }

    pub fn is_connected(&self) -> bool {
        self.active_connection.is_some()
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("connected", &self.is_connected())
            .field("active_database_name", &self.active_database_name)
            .field("pending_queries", &self.pending_queries.len())
            .field("opened", &self.opened.len())
            .finish()
    }
}

/// Shared handle to one `ConnectionState`. Never hold the lock across an await.
pub type SharedState = Arc<StdMutex<ConnectionState>>;

pub struct StateStore {
    scope: StateScope,
    shared: SharedState,
    sessions: DashMap<SessionId, SharedState>,
}

impl StateStore {
    pub fn new(scope: StateScope) -> Self {
        Self {
            scope,
            shared: SharedState::default(),
            sessions: DashMap::new(),
        }
    }

    /// State a request from `session_id` runs against.
    pub fn for_session(&self, session_id: SessionId) -> SharedState {
        match self.scope {
            StateScope::Shared => Arc::clone(&self.shared),
            StateScope::PerSession => Arc::clone(
                self.sessions
                    .entry(session_id)
                    .or_insert_with(SharedState::default)
                    .value(),
            ),
        }
    }

    /// Drop a session's state. Returns its server so the caller can disconnect it.
    pub fn discard(&self, session_id: SessionId) -> Option<Arc<dyn Server>> {
        if self.scope != StateScope::PerSession {
            return None;
        }
        let (_, state) = self.sessions.remove(&session_id)?;
        let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.pending_queries.clear();
        let server = state.active_server.take();
        state.clear_connection();
        server
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Lock a state, recovering from poisoning: a panicked handler must not wedge the worker.
pub fn lock_state(state: &SharedState) -> std::sync::MutexGuard<'_, ConnectionState> {
    state.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Connection state mutex poisoned - recovering");
        poisoned.into_inner()
    })
}
