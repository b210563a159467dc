//! Worker process side of the control protocol.
//!
//! The coordinator (parent) side is in coordinator.rs.
//!
//! Architecture:
//! - Control channel (stdin/stdout): Init, Close, Shutdown in; Ready, Log, ShuttingDown out
//! - Session channels: one Unix socket per client session, served by the `Dispatcher`
//!
//! The control loop only wires channels to the dispatcher; requests never pass through it.

use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, stdin, stdout};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{WorkerControl, WorkerEvent};
use crate::bridge::transport::connect_channel;
use crate::dispatcher::Dispatcher;
use crate::version::SQLWIRE_VERSION;

async fn next_log(logs: &mut Option<mpsc::Receiver<WorkerEvent>>) -> Option<WorkerEvent> {
    match logs {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Serve the control protocol until Shutdown or until the coordinator goes away.
///
/// Sends Ready first. `logs` carries events from `WorkerTracingLayer`.
pub async fn serve_control<R, W>(
    reader: R,
    writer: W,
    dispatcher: Arc<Dispatcher>,
    mut logs: Option<mpsc::Receiver<WorkerEvent>>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut ctrl_reader = FramedRead::new(reader, JsonCodec::<WorkerControl>::new());
    let mut ctrl_writer = FramedWrite::new(writer, JsonCodec::<WorkerEvent>::new());

    ctrl_writer
        .send(WorkerEvent::Ready {
            version: SQLWIRE_VERSION.to_string(),
        })
        .await?;
    tracing::info!(version = SQLWIRE_VERSION, "Worker ready");

    loop {
        tokio::select! {
            biased;

            ctrl_msg = ctrl_reader.next() => {
                match ctrl_msg {
                    Some(Ok(WorkerControl::Init { session_id, channel })) => {
                        tracing::trace!(%session_id, ?channel, "Connecting session channel");
                        match connect_channel(&channel).await {
                            Ok(stream) => dispatcher.attach(session_id, stream),
                            Err(e) => {
                                tracing::error!(%session_id, error = %e, "Failed to connect session channel");
                            }
                        }
                    }
                    Some(Ok(WorkerControl::Close { session_id })) => {
                        dispatcher.detach(session_id).await;
                    }
                    Some(Ok(WorkerControl::Shutdown)) => {
                        tracing::info!("Shutdown requested");
                        let _ = ctrl_writer.send(WorkerEvent::ShuttingDown).await;
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Control channel error");
                        break;
                    }
                    None => {
                        tracing::error!("Control channel closed (coordinator died?), exiting");
                        break;
                    }
                }
            }

            log = next_log(&mut logs) => {
                match log {
                    Some(event) => {
                        if ctrl_writer.send(event).await.is_err() {
                            break;
                        }
                    }
                    None => logs = None,
                }
            }
        }
    }

    tracing::info!(sessions = dispatcher.session_count(), "Worker exiting");
    dispatcher.detach_all().await;
    Ok(())
}

/// Run the worker over stdin/stdout.
pub async fn run_worker(
    dispatcher: Arc<Dispatcher>,
    logs: Option<mpsc::Receiver<WorkerEvent>>,
) -> io::Result<()> {
    serve_control(stdin(), stdout(), dispatcher, logs).await
}
