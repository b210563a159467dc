//! Worker process: owns database connections and serves session channels.
//!
//! Spawned by the coordinator with the control channel on stdin/stdout.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;

use sqlwire::driver::DriverRegistry;
use sqlwire::memory::{self, MemoryDriver};
use sqlwire::{Dispatcher, DispatcherConfig, StateScope, WorkerEnv, logging, standard_handlers};

/// Worker log events buffered before the control loop picks them up.
const LOG_BUFFER: usize = 1024;

fn drivers() -> DriverRegistry {
    DriverRegistry::new().with_driver(
        memory::CLIENT_NAME,
        Arc::new(MemoryDriver::new().with_database("main", ["settings"])),
    )
}

fn state_scope() -> StateScope {
    match std::env::var("SQLWIRE_STATE_SCOPE").as_deref() {
        Ok("session") => StateScope::PerSession,
        _ => StateScope::Shared,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (log_tx, log_rx) = mpsc::channel(LOG_BUFFER);
    logging::init_tracing(Some(log_tx));

    let env = WorkerEnv::from_env();
    tracing::info!(platform = %env.platform, locale = ?env.locale, "Worker process starting");
    if env.os_user.is_none() {
        tracing::warn!("No OS user passed to worker, create will fail");
    }

    let config = DispatcherConfig::default().with_scope(state_scope());
    let dispatcher = Dispatcher::new(standard_handlers(drivers(), env.os_user), config);

    sqlwire::run_worker(dispatcher, Some(log_rx))
        .await
        .context("worker control loop failed")
}
