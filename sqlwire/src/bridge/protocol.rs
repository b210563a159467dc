//! Wire protocol types shared by the coordinator, the worker and client sessions.
//!
//! Three kinds of links:
//! - **Worker control** (worker stdin/stdout): Init, Close, Shutdown + Ready, Log, ShuttingDown
//! - **Session channel** (one socket per window): Request frames in, Reply/Push frames out
//! - **Channel grant**: metadata handed to a client alongside its channel endpoint

use serde::{Deserialize, Serialize};

use super::transport::ChannelInfo;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(uuid::Uuid::parse_str(s)?))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Opaque per-channel session token, minted by the coordinator.
    ///
    /// A window receives a fresh one every time it is handed a channel, so a
    /// session id never outlives the worker that it was minted for.
    SessionId
);

uuid_id!(
    /// Correlation id for one request/reply exchange on a session channel.
    RequestId
);

uuid_id!(
    /// Key of a created-but-not-yet-finished cancelable query in worker state.
    QueryId
);

/// Control frames from coordinator to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerControl {
    /// A new session channel is waiting for the worker to connect.
    Init {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        channel: ChannelInfo,
    },

    /// The session's window closed; the worker drops the channel and its state.
    Close {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },

    Shutdown,
}

/// Control frames from worker to coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// First frame after spawn. The coordinator waits for it before handing out channels.
    Ready { version: String },

    /// Worker tracing event, re-emitted by the coordinator.
    Log {
        target: String,
        level: String,
        message: String,
    },

    ShuttingDown,
}

/// Metadata delivered to a client session together with its channel endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelGrant {
    pub session_id: SessionId,
    /// Set when the channel replaces one lost to a worker restart; all
    /// worker-side state of the previous channel is gone.
    pub worker_restarted: bool,
}

/// Client to worker: invoke a named operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: RequestId,
    pub name: String,
    pub args: serde_json::Value,
}

/// Worker to client: the single terminal answer to a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyFrame {
    Reply {
        id: RequestId,
        #[serde(default)]
        data: serde_json::Value,
    },

    Error {
        id: RequestId,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
}

impl ReplyFrame {
    pub fn reply(id: RequestId, data: serde_json::Value) -> Self {
        Self::Reply { id, data }
    }

    pub fn error(id: RequestId, error: impl Into<String>, stack: Option<String>) -> Self {
        Self::Error {
            id,
            error: error.into(),
            stack,
        }
    }

    pub fn id(&self) -> RequestId {
        match self {
            Self::Reply { id, .. } | Self::Error { id, .. } => *id,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Worker to client: unsolicited event, routed by `type` to a listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFrame {
    #[serde(rename = "type")]
    pub event: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// Anything the worker writes on a session channel.
///
/// Untagged: a frame whose `type` is `reply`/`error` and which carries a valid
/// request id is a reply, everything else is a push event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerFrame {
    Reply(ReplyFrame),
    Push(PushFrame),
}

impl From<ReplyFrame> for WorkerFrame {
    fn from(frame: ReplyFrame) -> Self {
        Self::Reply(frame)
    }
}

impl From<PushFrame> for WorkerFrame {
    fn from(frame: PushFrame) -> Self {
        Self::Push(frame)
    }
}
