//! IPC wire layer shared by the coordinator, the worker and client sessions.
//!
//! # Architecture
//!
//! - **protocol**: Frame types (WorkerControl/WorkerEvent, RequestFrame, ReplyFrame, PushFrame)
//! - **codec**: Length-prefixed JSON codec for AsyncRead/AsyncWrite
//! - **transport**: Per-session Unix socket channels

pub mod codec;
pub mod protocol;
pub mod transport;
