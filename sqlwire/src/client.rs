//! Client RPC bridge - runs inside a client session.
//!
//! Turns `send(operation, args)` into request frames on the session's channel
//! and resolves the returned future when the matching reply arrives. Requests
//! made before a channel is assigned are queued and flushed in order once one
//! arrives.
//!
//! Every assigned channel gets a generation number. When a channel is lost
//! (worker died, endpoint closed) or replaced, every request still pending on
//! that generation fails with `BridgeError::TransportLost`.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    ChannelGrant, PushFrame, ReplyFrame, RequestFrame, RequestId, SessionId, WorkerFrame,
};
use crate::coordinator::ChannelAssignment;

/// Local push event delivered when a channel replaces one lost to a worker restart.
pub const WORKER_RESTARTED_EVENT: &str = "worker-restarted";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// The worker replied with an error frame. Displays as the message alone.
    #[error("{message}")]
    Remote {
        message: String,
        stack: Option<String>,
    },

    #[error("transport lost: channel to worker closed before a reply arrived")]
    TransportLost,

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("bridge closed")]
    Closed,
}

/// Asks the coordinator for a channel. Called at most once per bridge.
pub trait PortRequester: Send + Sync + 'static {
    fn request_port(&self);
}

/// Reply to one `send`. Resolves with the reply's `data` or the error.
#[must_use = "the reply is lost if the future is dropped"]
pub struct PendingReply {
    rx: oneshot::Receiver<Result<Value, BridgeError>>,
}

impl PendingReply {
    fn ready(result: Result<Value, BridgeError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl Future for PendingReply {
    type Output = Result<Value, BridgeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(BridgeError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

type ReplySender = oneshot::Sender<Result<Value, BridgeError>>;

/// Handle returned by `add_listener`, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerFn = Arc<dyn Fn(Value) + Send + Sync>;

struct Listener {
    id: ListenerId,
    event: String,
    handler: ListenerFn,
}

struct Queued {
    name: String,
    args: Map<String, Value>,
    reply: ReplySender,
}

struct Pending {
    generation: u64,
    reply: ReplySender,
}

struct ActiveChannel {
    session_id: SessionId,
    generation: u64,
    tx: mpsc::UnboundedSender<RequestFrame>,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct BridgeState {
    channel: Option<ActiveChannel>,
    generation: u64,
    queue: VecDeque<Queued>,
    pending: HashMap<RequestId, Pending>,
}

impl BridgeState {
    /// Fail every pending request that is not on `keep_generation`.
    fn fail_stale(&mut self, keep_generation: Option<u64>) -> usize {
        let stale: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| Some(p.generation) != keep_generation)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            if let Some(pending) = self.pending.remove(id) {
                let _ = pending.reply.send(Err(BridgeError::TransportLost));
            }
        }
        stale.len()
    }
}

struct Inner {
    state: Mutex<BridgeState>,
    listeners: Mutex<Vec<Listener>>,
    next_listener: AtomicU64,
    port_requested: AtomicBool,
    requester: Arc<dyn PortRequester>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<Listener>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn request_port_once(&self) {
        if !self.port_requested.swap(true, Ordering::SeqCst) {
            tracing::debug!("Requesting channel from coordinator");
            self.requester.request_port();
        }
    }

    fn lose_channel(&self, generation: u64) {
        let mut state = self.state();
        let current = state.channel.as_ref().map(|c| c.generation);
        if current == Some(generation)
            && let Some(channel) = state.channel.take()
        {
            channel.reader.abort();
            tracing::warn!(session_id = %channel.session_id, generation, "Channel to worker lost");
        }

        let keep = state.channel.as_ref().map(|c| c.generation);
        let failed = state.fail_stale(keep);
        if failed > 0 {
            tracing::warn!(generation, failed, "Failed pending requests on lost channel");
        }
    }

    fn handle_frame(&self, frame: WorkerFrame) {
        match frame {
            WorkerFrame::Reply(ReplyFrame::Reply { id, data }) => {
                let pending = self.state().pending.remove(&id);
                match pending {
                    Some(pending) => {
                        let _ = pending.reply.send(Ok(data));
                    }
                    None => tracing::debug!(request_id = %id, "Reply for unknown request, dropping"),
                }
            }
            WorkerFrame::Reply(ReplyFrame::Error { id, error, stack }) => {
                let pending = self.state().pending.remove(&id);
                match pending {
                    Some(pending) => {
                        let _ = pending.reply.send(Err(BridgeError::Remote {
                            message: error,
                            stack,
                        }));
                    }
                    None => tracing::debug!(request_id = %id, %error, "Error for unknown request, dropping"),
                }
            }
            WorkerFrame::Push(push) => self.dispatch_push(push),
        }
    }

    fn dispatch_push(&self, push: PushFrame) {
        let handler = self
            .listeners()
            .iter()
            .find(|l| l.event == push.event)
            .map(|l| Arc::clone(&l.handler));

        match handler {
            Some(handler) => handler(push.input),
            None => tracing::debug!(event = %push.event, "No listener for push event, dropping"),
        }
    }
}

fn stamp(mut args: Map<String, Value>, session_id: SessionId) -> Value {
    args.insert("sessionId".to_string(), json!(session_id));
    Value::Object(args)
}

/// One client session's view of the worker.
#[derive(Clone)]
pub struct ClientBridge {
    inner: Arc<Inner>,
}

impl ClientBridge {
    pub fn new(requester: Arc<dyn PortRequester>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BridgeState::default()),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                port_requested: AtomicBool::new(false),
                requester,
            }),
        }
    }

    /// Invoke a named operation on the worker.
    ///
    /// Never fails synchronously. The request is registered (sent or queued)
    /// before this returns, so call order is send order.
    pub fn send(&self, name: &str, args: Value) -> PendingReply {
        let args = match args {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return PendingReply::ready(Err(BridgeError::InvalidArgs(format!(
                    "expected an object, got {other}"
                ))));
            }
        };

        let (reply, rx) = oneshot::channel();
        let mut state = self.inner.state();

        if let Some(channel) = &state.channel {
            let id = RequestId::new();
            let frame = RequestFrame {
                id,
                name: name.to_string(),
                args: stamp(args, channel.session_id),
            };
            let generation = channel.generation;

            match channel.tx.send(frame) {
                Ok(()) => {
                    state.pending.insert(id, Pending { generation, reply });
                    return PendingReply { rx };
                }
                Err(mpsc::error::SendError(frame)) => {
                    // Writer already gone: treat as lost and queue for the next channel.
                    drop(state);
                    self.inner.lose_channel(generation);
                    state = self.inner.state();
                    let args = match frame.args {
                        Value::Object(args) => args,
                        _ => Map::new(),
                    };
                    state.queue.push_back(Queued {
                        name: frame.name,
                        args,
                        reply,
                    });
                    return PendingReply { rx };
                }
            }
        }

        tracing::trace!(operation = name, queued = state.queue.len() + 1, "No channel yet, queueing");
        state.queue.push_back(Queued {
            name: name.to_string(),
            args,
            reply,
        });
        drop(state);
        self.inner.request_port_once();
        PendingReply { rx }
    }

    /// Take ownership of a newly assigned channel endpoint.
    ///
    /// Requests still pending on an earlier channel fail with `TransportLost`.
    /// Queued requests are flushed in FIFO order.
    pub fn set_channel(&self, stream: UnixStream, grant: ChannelGrant) {
        let (read_half, write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<RequestFrame>();

        let mut state = self.inner.state();
        state.generation += 1;
        let generation = state.generation;

        if let Some(previous) = state.channel.take() {
            previous.reader.abort();
        }
        let failed = state.fail_stale(None);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut writer = FramedWrite::new(write_half, JsonCodec::<RequestFrame>::new());
            while let Some(frame) = rx.recv().await {
                if let Err(e) = writer.send(frame).await {
                    tracing::warn!(generation, error = %e, "Failed to write request");
                    inner.lose_channel(generation);
                    break;
                }
            }
        });

        let inner = Arc::clone(&self.inner);
        let reader = tokio::spawn(async move {
            let mut reader = FramedRead::new(read_half, JsonCodec::<WorkerFrame>::new());
            loop {
                match reader.next().await {
                    Some(Ok(frame)) => inner.handle_frame(frame),
                    Some(Err(e)) => {
                        tracing::warn!(generation, error = %e, "Channel read error");
                        break;
                    }
                    None => {
                        tracing::debug!(generation, "Channel closed by worker");
                        break;
                    }
                }
            }
            inner.lose_channel(generation);
        });

        let queued = std::mem::take(&mut state.queue);
        let flushed = queued.len();
        for item in queued {
            let id = RequestId::new();
            let frame = RequestFrame {
                id,
                name: item.name,
                args: stamp(item.args, grant.session_id),
            };
            if tx.send(frame).is_ok() {
                state.pending.insert(
                    id,
                    Pending {
                        generation,
                        reply: item.reply,
                    },
                );
            } else {
                let _ = item.reply.send(Err(BridgeError::TransportLost));
            }
        }

        state.channel = Some(ActiveChannel {
            session_id: grant.session_id,
            generation,
            tx,
            reader,
        });
        drop(state);

        tracing::info!(
            session_id = %grant.session_id,
            generation,
            flushed,
            failed,
            worker_restarted = grant.worker_restarted,
            "Channel assigned"
        );

        if grant.worker_restarted {
            self.inner.dispatch_push(PushFrame {
                event: WORKER_RESTARTED_EVENT.to_string(),
                input: json!({ "sessionId": grant.session_id }),
            });
        }
    }

    /// Apply every channel assignment delivered by the coordinator.
    pub fn bind(&self, mut assignments: mpsc::UnboundedReceiver<ChannelAssignment>) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            while let Some(assignment) = assignments.recv().await {
                bridge.set_channel(assignment.endpoint, assignment.grant);
            }
            tracing::debug!("Coordinator stopped delivering channels");
        })
    }

    /// Register a push-event listener. Only the earliest registered listener
    /// for an event type is invoked.
    pub fn add_listener<F>(&self, event: impl Into<String>, handler: F) -> ListenerId
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners().push(Listener {
            id,
            event: event.into(),
            handler: Arc::new(handler),
        });
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.state().channel.as_ref().map(|c| c.session_id)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state().channel.is_some()
    }

    pub fn queued(&self) -> usize {
        self.inner.state().queue.len()
    }

    pub fn pending(&self) -> usize {
        self.inner.state().pending.len()
    }
}
