//! Worker-side request dispatch.
//!
//! The dispatcher owns the immutable handler table and the connection state.
//! Each attached session channel gets a reader task and a writer task; every
//! request frame runs on its own task so a slow operation never blocks the
//! next frame (that is what lets `cancelQuery` reach a running `executeQuery`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{PushFrame, ReplyFrame, RequestFrame, SessionId, WorkerFrame};
use crate::driver::DriverError;
use crate::state::{ActiveConnection, SharedState, StateScope, StateStore, lock_state};

/// Reply text for an operation name missing from the handler table.
pub const INVALID_HANDLER_NAME: &str = "Invalid handler name";

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("No database connection found")]
    NoConnection,

    #[error("Could not determine OS user name")]
    MissingUsername,

    #[error("Query id is required")]
    MissingQueryId,

    #[error("Query not found")]
    QueryNotFound,

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl HandlerError {
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::InvalidArgs(message.into())
    }

    /// Error chain rendered for the `stack` field of an error reply.
    /// `None` when the error has no underlying cause.
    pub fn stack(&self) -> Option<String> {
        let mut source = std::error::Error::source(self);
        if source.is_none() {
            return None;
        }

        let mut stack = self.to_string();
        while let Some(cause) = source {
            stack.push_str("\ncaused by: ");
            stack.push_str(&cause.to_string());
            source = cause.source();
        }
        Some(stack)
    }
}

/// Writes push frames to one session's channel.
#[derive(Clone)]
pub struct PushSender {
    tx: mpsc::UnboundedSender<WorkerFrame>,
}

impl PushSender {
    pub fn new(tx: mpsc::UnboundedSender<WorkerFrame>) -> Self {
        Self { tx }
    }

    /// Returns false once the channel is gone.
    pub fn push(&self, event: impl Into<String>, input: Value) -> bool {
        self.tx
            .send(WorkerFrame::Push(PushFrame {
                event: event.into(),
                input,
            }))
            .is_ok()
    }
}

/// Everything a handler may touch while serving one request.
pub struct OperationContext {
    pub session_id: SessionId,
    pub state: SharedState,
    pub push: PushSender,
    serialize_operations: bool,
}

impl OperationContext {
    pub fn new(
        session_id: SessionId,
        state: SharedState,
        push: PushSender,
        serialize_operations: bool,
    ) -> Self {
        Self {
            session_id,
            state,
            push,
            serialize_operations,
        }
    }

    /// The active connection, or the fixed "no connection" precondition error.
    pub fn active_connection(&self) -> Result<ActiveConnection, HandlerError> {
        lock_state(&self.state)
            .active_connection
            .clone()
            .ok_or(HandlerError::NoConnection)
    }

    /// Take the connection's operation lock when operations are serialized.
    pub async fn serialize<'a>(
        &self,
        active: &'a ActiveConnection,
    ) -> Option<tokio::sync::MutexGuard<'a, ()>> {
        if self.serialize_operations {
            Some(active.lock_ops().await)
        } else {
            None
        }
    }
}

/// One named operation.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, ctx: &OperationContext, args: Value) -> Result<Value, HandlerError>;
}

/// Immutable operation-name → handler mapping, built once at process start.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: Arc<HashMap<String, Arc<dyn Handler>>>,
}

impl HandlerTable {
    pub fn builder() -> HandlerTableBuilder {
        HandlerTableBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Default)]
pub struct HandlerTableBuilder {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerTableBuilder {
    pub fn handler(mut self, name: impl Into<String>, handler: impl Handler) -> Self {
        let name = name.into();
        if self.handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            tracing::warn!(operation = %name, "Handler registered twice, keeping the last one");
        }
        self
    }

    /// Register an operation that is forwarded verbatim to the active connection.
    pub fn pass_through(self, name: &str) -> Self {
        self.handler(name, crate::handlers::PassThrough::new(name))
    }

    pub fn build(self) -> HandlerTable {
        HandlerTable {
            handlers: Arc::new(self.handlers),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    pub scope: StateScope,
    /// Keep at most one driver call in flight per connection.
    pub serialize_operations: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            scope: StateScope::Shared,
            serialize_operations: true,
        }
    }
}

impl DispatcherConfig {
    pub fn with_scope(mut self, scope: StateScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_serialized_operations(mut self, serialize: bool) -> Self {
        self.serialize_operations = serialize;
        self
    }
}

struct SessionChannel {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SessionChannel {
    fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

pub struct Dispatcher {
    handlers: HandlerTable,
    states: StateStore,
    config: DispatcherConfig,
    sessions: DashMap<SessionId, SessionChannel>,
}

impl Dispatcher {
    pub fn new(handlers: HandlerTable, config: DispatcherConfig) -> Arc<Self> {
        tracing::debug!(operations = handlers.len(), scope = ?config.scope, "Dispatcher created");
        Arc::new(Self {
            handlers,
            states: StateStore::new(config.scope),
            config,
            sessions: DashMap::new(),
        })
    }

    pub fn states(&self) -> &StateStore {
        &self.states
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Start serving a session channel.
    pub fn attach(self: &Arc<Self>, session_id: SessionId, stream: UnixStream) {
        let (read_half, write_half) = stream.into_split();
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<WorkerFrame>();

        let writer = tokio::spawn(async move {
            let mut writer = FramedWrite::new(write_half, JsonCodec::<WorkerFrame>::new());
            while let Some(frame) = frame_rx.recv().await {
                if let Err(e) = writer.send(frame).await {
                    tracing::warn!(%session_id, error = %e, "Failed to write to session channel");
                    break;
                }
            }
            tracing::trace!(%session_id, "Session writer exiting");
        });

        let dispatcher = Arc::clone(self);
        let reader = tokio::spawn(async move {
            let mut reader = FramedRead::new(read_half, JsonCodec::<RequestFrame>::new());
            let push = PushSender::new(frame_tx.clone());
            loop {
                match reader.next().await {
                    Some(Ok(frame)) => {
                        let dispatcher = Arc::clone(&dispatcher);
                        let push = push.clone();
                        let frame_tx = frame_tx.clone();
                        tokio::spawn(async move {
                            let reply = dispatcher.run_operation(session_id, frame, push).await;
                            if frame_tx.send(reply.into()).is_err() {
                                tracing::debug!(%session_id, "Session channel gone before reply");
                            }
                        });
                    }
                    Some(Err(e)) => {
                        tracing::error!(%session_id, error = %e, "Session channel read error");
                        break;
                    }
                    None => {
                        tracing::debug!(%session_id, "Session channel closed by client");
                        break;
                    }
                }
            }
        });

        // Touch state now so per-session state exists from the moment of init.
        let _ = self.states.for_session(session_id);

        if let Some(previous) = self
            .sessions
            .insert(session_id, SessionChannel { reader, writer })
        {
            tracing::warn!(%session_id, "Session attached twice, replacing old channel");
            previous.abort();
        }
        tracing::info!(%session_id, "Session attached");
    }

    /// Stop serving a session channel and drop its state (per-session scope).
    pub async fn detach(&self, session_id: SessionId) {
        match self.sessions.remove(&session_id) {
            Some((_, channel)) => channel.abort(),
            None => tracing::debug!(%session_id, "Close for unknown session"),
        }
        if let Some(server) = self.states.discard(session_id) {
            server.disconnect().await;
        }
        tracing::info!(%session_id, "Session detached");
    }

    /// Detach every session, as on worker exit.
    pub async fn detach_all(&self) {
        let sessions: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for session_id in sessions {
            self.detach(session_id).await;
        }
    }

    /// Run one request to completion and produce its single reply.
    pub async fn run_operation(
        &self,
        session_id: SessionId,
        frame: RequestFrame,
        push: PushSender,
    ) -> ReplyFrame {
        let RequestFrame { id, name, args } = frame;

        let Some(handler) = self.handlers.get(&name) else {
            tracing::warn!(%session_id, operation = %name, "Unknown operation");
            return ReplyFrame::error(id, INVALID_HANDLER_NAME, None);
        };

        let ctx = OperationContext::new(
            session_id,
            self.states.for_session(session_id),
            push,
            self.config.serialize_operations,
        );

        tracing::debug!(%session_id, request_id = %id, operation = %name, "Running operation");
        let outcome = std::panic::AssertUnwindSafe(handler.handle(&ctx, args))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(data)) => ReplyFrame::reply(id, data),
            Ok(Err(e)) => {
                tracing::debug!(%session_id, request_id = %id, operation = %name, error = %e, "Operation failed");
                ReplyFrame::error(id, e.to_string(), e.stack())
            }
            Err(_) => {
                tracing::error!(%session_id, request_id = %id, operation = %name, "Handler panicked");
                ReplyFrame::error(id, format!("handler for {name} panicked"), None)
            }
        }
    }
}
