//! sqlwire: cross-process RPC transport between client sessions and a database worker.

mod version;

pub mod bridge;
pub mod client;
pub mod coordinator;
pub mod dispatcher;
pub mod driver;
pub mod env;
pub mod handlers;
pub mod logging;
pub mod memory;
pub mod state;
pub mod worker;
mod worker_tracing_layer;

pub use client::{BridgeError, ClientBridge, ListenerId, PendingReply, PortRequester};
pub use coordinator::{
    ChannelAssignment, ClientSession, CoordinatorConfig, CoordinatorError, CoordinatorHandle,
    CoordinatorStatus, ProcessSpawner, SpawnError, WindowId, WorkerSpawner, start,
};
pub use dispatcher::{Dispatcher, DispatcherConfig, Handler, HandlerError, HandlerTable};
pub use driver::{DriverError, DriverRegistry};
pub use env::WorkerEnv;
pub use handlers::standard_handlers;
pub use state::StateScope;
pub use version::{SQLWIRE_VERSION, VersionInfo};
pub use worker::{run_worker, serve_control};
pub use worker_tracing_layer::WorkerTracingLayer;
