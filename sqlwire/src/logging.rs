//! Tracing subscriber setup for the supervisor and the worker process.

use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::bridge::protocol::WorkerEvent;
use crate::worker_tracing_layer::WorkerTracingLayer;

/// Filter from `RUST_LOG` if set, else `SQLWIRE_LOG` (debug, info, warn, error).
pub fn log_filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }

    let level = match std::env::var("SQLWIRE_LOG").as_deref() {
        Ok("trace") => "trace",
        Ok("debug") => "debug",
        Ok("warn") | Ok("warning") => "warn",
        Ok("error") => "error",
        _ => "info",
    };
    EnvFilter::new(format!("sqlwire={level},sqlwire::bridge::codec=off"))
}

/// Install the global subscriber.
///
/// With `worker_events` set (worker process), events are shipped to the
/// coordinator instead of being written to stderr. Stdout is never written to:
/// in the worker it carries the control channel.
pub fn init_tracing(worker_events: Option<mpsc::Sender<WorkerEvent>>) {
    let filter = log_filter();
    let ship = worker_events.map(WorkerTracingLayer::new);
    let to_stderr = ship.is_none();
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(to_stderr.then(|| fmt::layer().json().with_writer(std::io::stderr)))
            .with(ship)
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(to_stderr.then(|| fmt::layer().with_writer(std::io::stderr)))
            .with(ship)
            .try_init();
    }
}

/// Re-emit a worker log event in the supervisor under the `sqlwire::worker` target.
pub fn emit_worker_log(target: &str, level: &str, message: &str) {
    match level {
        "error" => tracing::error!(target: "sqlwire::worker", worker_target = target, "{message}"),
        "warn" => tracing::warn!(target: "sqlwire::worker", worker_target = target, "{message}"),
        "debug" => tracing::debug!(target: "sqlwire::worker", worker_target = target, "{message}"),
        "trace" => tracing::trace!(target: "sqlwire::worker", worker_target = target, "{message}"),
        _ => tracing::info!(target: "sqlwire::worker", worker_target = target, "{message}"),
    }
}
