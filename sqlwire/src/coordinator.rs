//! Coordinator - owns the worker process and hands out session channels.
//!
//! Flow:
//! 1. Spawn worker, wait for Ready
//! 2. Per client window: mint a session id, create a channel, send Init to the
//!    worker, accept its connection, deliver the other end to the client
//! 3. On worker exit: spawn a new worker and redistribute channels to every
//!    open window with `workerRestarted = true`. A failed respawn is retried
//!    every `restart_interval` until a worker comes up.
//!
//! All state lives in one actor task; `CoordinatorHandle` sends it commands.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::process::Command as ProcessCommand;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ChannelGrant, SessionId, WorkerControl, WorkerEvent};
use crate::bridge::transport::create_channel;
use crate::client::{ClientBridge, PortRequester};
use crate::env::WorkerEnv;
use crate::logging::emit_worker_log;
use crate::version::VersionInfo;

pub const WORKER_BINARY: &str = "sqlwire-worker";

/// Identifies a client window for the lifetime of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowId(u64);

impl std::fmt::Display for WindowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "window-{}", self.0)
    }
}

/// A channel endpoint handed to a client session.
#[derive(Debug)]
pub struct ChannelAssignment {
    pub endpoint: UnixStream,
    pub grant: ChannelGrant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code, `None` if killed by a signal or the status could not be read.
    pub code: Option<i32>,
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "killed"),
        }
    }
}

/// The coordinator's side of a spawned worker.
pub struct WorkerLink {
    /// Worker control input (its stdin).
    pub control: Box<dyn AsyncWrite + Send + Unpin>,
    /// Worker events output (its stdout).
    pub events: Box<dyn AsyncRead + Send + Unpin>,
    /// Resolves when the worker exits. Dropping it must stop the worker.
    pub exit: BoxFuture<'static, WorkerExit>,
}

#[derive(Debug, Clone)]
pub struct WorkerSpawnConfig {
    pub env: WorkerEnv,
    pub generation: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync + 'static {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<WorkerLink, SpawnError>;
}

/// Spawns the `sqlwire-worker` binary as a child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpawner {
    program: Option<PathBuf>,
}

impl ProcessSpawner {
    /// Look for the worker binary next to the current executable.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
        }
    }

    fn program(&self) -> Result<PathBuf, SpawnError> {
        if let Some(program) = &self.program {
            return Ok(program.clone());
        }

        let exe = std::env::current_exe()?;
        let name = format!("{WORKER_BINARY}{}", std::env::consts::EXE_SUFFIX);
        // Test binaries live one level below the other artifacts (target/*/deps).
        exe.ancestors()
            .skip(1)
            .take(2)
            .map(|dir| dir.join(&name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                SpawnError::Other(format!("{name} not found next to {}", exe.display()))
            })
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<WorkerLink, SpawnError> {
        let program = self.program()?;
        tracing::debug!(program = %program.display(), generation = config.generation, "Spawning worker process");

        let mut child = ProcessCommand::new(&program)
            .envs(config.env.to_env_vars())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;

        let exit = async move {
            match child.wait().await {
                Ok(status) => WorkerExit {
                    code: status.code(),
                },
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to wait for worker");
                    WorkerExit { code: None }
                }
            }
        }
        .boxed();

        Ok(WorkerLink {
            control: Box::new(stdin),
            events: Box::new(stdout),
            exit,
        })
    }
}

pub struct CoordinatorConfig {
    pub spawner: Arc<dyn WorkerSpawner>,
    pub worker_env: WorkerEnv,
    /// Bound on spawn → Ready.
    pub ready_timeout: Duration,
    /// Bound on Init → worker connected to the session channel.
    pub attach_timeout: Duration,
    /// Grace period for the worker to exit after Shutdown before it is killed.
    pub shutdown_timeout: Duration,
    /// Delay between attempts to bring a worker back after a failed respawn.
    pub restart_interval: Duration,
}

impl CoordinatorConfig {
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            spawner,
            worker_env: WorkerEnv::default(),
            ready_timeout: Duration::from_secs(30),
            attach_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
            restart_interval: Duration::from_secs(1),
        }
    }

    pub fn with_worker_env(mut self, env: WorkerEnv) -> Self {
        self.worker_env = env;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_attach_timeout(mut self, timeout: Duration) -> Self {
        self.attach_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_restart_interval(mut self, interval: Duration) -> Self {
        self.restart_interval = interval;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("worker did not become ready within {0:?}")]
    ReadyTimeout(Duration),
    #[error("worker did not connect to session channel within {0:?}")]
    AttachTimeout(Duration),
    #[error("worker exited before it was ready")]
    WorkerExited,
    #[error("no worker running")]
    WorkerUnavailable,
    #[error("channel error: {0}")]
    Channel(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("coordinator stopped")]
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorStatus {
    /// Number of workers spawned so far; the running worker is the latest.
    pub generation: u64,
    pub worker_running: bool,
    pub version: VersionInfo,
    pub windows: usize,
    /// Windows currently holding a channel.
    pub connected: usize,
}

enum Command {
    Register {
        reply: oneshot::Sender<(WindowId, mpsc::UnboundedReceiver<ChannelAssignment>)>,
    },
    Ready {
        window: WindowId,
    },
    RequestChannel {
        window: WindowId,
    },
    Close {
        window: WindowId,
    },
    WorkerExited {
        generation: u64,
        exit: WorkerExit,
    },
    RetryRestart,
    Status {
        reply: oneshot::Sender<CoordinatorStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct WindowEntry {
    /// Set by the first ready signal or port request.
    eligible: bool,
    session_id: Option<SessionId>,
    /// The window's channel died with a worker; its next grant reports the restart.
    lost_channel: bool,
    tx: mpsc::UnboundedSender<ChannelAssignment>,
}

struct RunningWorker {
    generation: u64,
    control: FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, JsonCodec<WorkerControl>>,
    watcher: JoinHandle<()>,
    relay: JoinHandle<()>,
}

struct Coordinator {
    config: CoordinatorConfig,
    commands: mpsc::WeakUnboundedSender<Command>,
    worker: Option<RunningWorker>,
    generation: u64,
    version: VersionInfo,
    windows: BTreeMap<WindowId, WindowEntry>,
    next_window: u64,
    restart_scheduled: bool,
}

/// Start the coordinator and spawn the first worker.
pub async fn start(config: CoordinatorConfig) -> Result<CoordinatorHandle, CoordinatorError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut coordinator = Coordinator {
        config,
        commands: tx.downgrade(),
        worker: None,
        generation: 0,
        version: VersionInfo::new(),
        windows: BTreeMap::new(),
        next_window: 0,
        restart_scheduled: false,
    };
    coordinator.ensure_worker_running().await?;
    tokio::spawn(coordinator.run(rx));
    Ok(CoordinatorHandle { tx })
}

async fn wait_ready(
    events: &mut FramedRead<Box<dyn AsyncRead + Send + Unpin>, JsonCodec<WorkerEvent>>,
) -> Result<String, CoordinatorError> {
    loop {
        match events.next().await {
            Some(Ok(WorkerEvent::Ready { version })) => return Ok(version),
            Some(Ok(WorkerEvent::Log {
                target,
                level,
                message,
            })) => emit_worker_log(&target, &level, &message),
            Some(Ok(WorkerEvent::ShuttingDown)) => return Err(CoordinatorError::WorkerExited),
            Some(Err(e)) => {
                return Err(CoordinatorError::Protocol(format!(
                    "control channel error: {e}"
                )));
            }
            None => return Err(CoordinatorError::WorkerExited),
        }
    }
}

async fn relay_events(
    generation: u64,
    mut events: FramedRead<Box<dyn AsyncRead + Send + Unpin>, JsonCodec<WorkerEvent>>,
) {
    loop {
        match events.next().await {
            Some(Ok(WorkerEvent::Log {
                target,
                level,
                message,
            })) => emit_worker_log(&target, &level, &message),
            Some(Ok(WorkerEvent::ShuttingDown)) => {
                tracing::info!(generation, "Worker shutting down");
            }
            Some(Ok(WorkerEvent::Ready { .. })) => {
                tracing::warn!(generation, "Unexpected Ready from running worker");
            }
            Some(Err(e)) => {
                tracing::error!(generation, error = %e, "Worker control channel error");
                break;
            }
            None => {
                tracing::debug!(generation, "Worker control channel closed");
                break;
            }
        }
    }
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Register { reply } => {
                    self.next_window += 1;
                    let window = WindowId(self.next_window);
                    let (tx, assignments) = mpsc::unbounded_channel();
                    self.windows.insert(
                        window,
                        WindowEntry {
                            eligible: false,
                            session_id: None,
                            lost_channel: false,
                            tx,
                        },
                    );
                    tracing::debug!(%window, "Window registered");
                    if reply.send((window, assignments)).is_err() {
                        self.windows.remove(&window);
                    }
                }
                Command::Ready { window } | Command::RequestChannel { window } => {
                    let Some(entry) = self.windows.get_mut(&window) else {
                        tracing::debug!(%window, "Channel requested for unknown window");
                        continue;
                    };
                    entry.eligible = true;
                    if entry.session_id.is_some() {
                        continue;
                    }
                    self.redistribute_channels(true, false).await;
                }
                Command::Close { window } => self.close_window(window).await,
                Command::WorkerExited { generation, exit } => {
                    if self.worker.as_ref().map(|w| w.generation) != Some(generation) {
                        tracing::debug!(generation, %exit, "Ignoring exit of superseded worker");
                        continue;
                    }
                    tracing::warn!(generation, %exit, "Worker exited, restarting");
                    self.drop_worker();
                    self.redistribute_channels(false, true).await;
                }
                Command::RetryRestart => {
                    self.restart_scheduled = false;
                    self.redistribute_channels(true, false).await;
                }
                Command::Status { reply } => {
                    let _ = reply.send(self.status());
                }
                Command::Shutdown { reply } => {
                    self.shutdown_worker().await;
                    let _ = reply.send(());
                    return;
                }
            }
        }

        tracing::debug!("All coordinator handles dropped");
        self.shutdown_worker().await;
    }

    fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            generation: self.generation,
            worker_running: self.worker.is_some(),
            version: self.version.clone(),
            windows: self.windows.len(),
            connected: self
                .windows
                .values()
                .filter(|w| w.session_id.is_some())
                .count(),
        }
    }

    async fn ensure_worker_running(&mut self) -> Result<(), CoordinatorError> {
        if self.worker.is_some() {
            return Ok(());
        }

        self.generation += 1;
        let generation = self.generation;
        let spawn_config = WorkerSpawnConfig {
            env: self.config.worker_env.clone(),
            generation,
        };

        tracing::info!(generation, "Spawning worker");
        let link = self.config.spawner.spawn(&spawn_config)?;
        let control = FramedWrite::new(link.control, JsonCodec::<WorkerControl>::new());
        let mut events = FramedRead::new(link.events, JsonCodec::<WorkerEvent>::new());

        let commands = self.commands.clone();
        let exit = link.exit;
        let watcher = tokio::spawn(async move {
            let exit = exit.await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::WorkerExited { generation, exit });
            }
        });

        tracing::debug!(generation, "Waiting for Ready from worker");
        let version = match tokio::time::timeout(self.config.ready_timeout, wait_ready(&mut events))
            .await
        {
            Ok(Ok(version)) => version,
            Ok(Err(e)) => {
                watcher.abort();
                return Err(e);
            }
            Err(_) => {
                watcher.abort();
                return Err(CoordinatorError::ReadyTimeout(self.config.ready_timeout));
            }
        };

        self.version = VersionInfo::new().with_worker(version);
        if !self.version.matches() {
            tracing::warn!(version = ?self.version, "Worker version differs from supervisor");
        }
        tracing::info!(generation, "Worker ready");

        let relay = tokio::spawn(relay_events(generation, events));
        self.worker = Some(RunningWorker {
            generation,
            control,
            watcher,
            relay,
        });
        Ok(())
    }

    /// Forget the current worker and every channel it served.
    fn drop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.relay.abort();
            worker.watcher.abort();
        }
        for entry in self.windows.values_mut() {
            if entry.session_id.take().is_some() {
                entry.lost_channel = true;
            }
        }
    }

    /// Queue another attempt to bring a worker up. At most one is pending.
    fn schedule_restart(&mut self) {
        if self.restart_scheduled {
            return;
        }
        self.restart_scheduled = true;
        let commands = self.commands.clone();
        let interval = self.config.restart_interval;
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::RetryRestart);
            }
        });
    }

    async fn redistribute_channels(&mut self, only_new: bool, worker_restarted: bool) {
        if let Err(e) = self.ensure_worker_running().await {
            tracing::error!(
                error = %e,
                retry_in = ?self.config.restart_interval,
                "Worker unavailable, channels not distributed"
            );
            self.schedule_restart();
            return;
        }

        let targets: Vec<WindowId> = self
            .windows
            .iter()
            .filter(|(_, w)| w.eligible && (!only_new || w.session_id.is_none()))
            .map(|(id, _)| *id)
            .collect();

        for window in targets {
            if let Err(e) = self.open_channel(window, worker_restarted).await {
                tracing::error!(%window, error = %e, "Failed to open session channel");
            }
        }
    }

    async fn open_channel(
        &mut self,
        window: WindowId,
        worker_restarted: bool,
    ) -> Result<(), CoordinatorError> {
        let session_id = SessionId::new();
        let (listener, channel) = create_channel(session_id)?;

        let worker = self
            .worker
            .as_mut()
            .ok_or(CoordinatorError::WorkerUnavailable)?;
        worker
            .control
            .send(WorkerControl::Init {
                session_id,
                channel,
            })
            .await
            .map_err(|e| CoordinatorError::Protocol(format!("failed to send Init: {e}")))?;

        let endpoint = tokio::time::timeout(self.config.attach_timeout, listener.accept())
            .await
            .map_err(|_| CoordinatorError::AttachTimeout(self.config.attach_timeout))??;

        let worker_restarted = worker_restarted
            || self
                .windows
                .get(&window)
                .is_some_and(|entry| entry.lost_channel);
        let grant = ChannelGrant {
            session_id,
            worker_restarted,
        };
        let delivered = match self.windows.get_mut(&window) {
            Some(entry) => {
                let delivered = entry.tx.send(ChannelAssignment { endpoint, grant }).is_ok();
                if delivered {
                    entry.session_id = Some(session_id);
                    entry.lost_channel = false;
                }
                delivered
            }
            None => false,
        };

        if delivered {
            tracing::info!(%window, %session_id, worker_restarted, "Channel delivered");
        } else {
            tracing::debug!(%window, %session_id, "Window gone before delivery, closing");
            self.send_close(session_id).await;
            self.windows.remove(&window);
        }
        Ok(())
    }

    async fn close_window(&mut self, window: WindowId) {
        let Some(entry) = self.windows.remove(&window) else {
            tracing::debug!(%window, "Close for unknown window");
            return;
        };
        if let Some(session_id) = entry.session_id {
            self.send_close(session_id).await;
        }
        tracing::info!(%window, "Window closed");
    }

    async fn send_close(&mut self, session_id: SessionId) {
        let Some(worker) = self.worker.as_mut() else {
            return;
        };
        if let Err(e) = worker.control.send(WorkerControl::Close { session_id }).await {
            tracing::warn!(%session_id, error = %e, "Failed to send Close to worker");
        }
    }

    async fn shutdown_worker(&mut self) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        tracing::info!(generation = worker.generation, "Shutting down worker");
        if let Err(e) = worker.control.send(WorkerControl::Shutdown).await {
            tracing::warn!(error = %e, "Failed to send Shutdown to worker");
        }

        // The watcher owns the exit future; aborting it kills a worker that is still running.
        if tokio::time::timeout(self.config.shutdown_timeout, &mut worker.watcher)
            .await
            .is_err()
        {
            tracing::warn!("Worker did not exit in time, killing");
            worker.watcher.abort();
        }
        worker.relay.abort();
    }
}

/// Cloneable handle to the coordinator actor.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl CoordinatorHandle {
    fn command(&self, command: Command) -> Result<(), CoordinatorError> {
        self.tx.send(command).map_err(|_| CoordinatorError::Stopped)
    }

    /// Record a new window. Channels are delivered on the returned receiver
    /// once the window signals `ready`.
    pub async fn register_session(
        &self,
    ) -> Result<(WindowId, mpsc::UnboundedReceiver<ChannelAssignment>), CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Register { reply })?;
        rx.await.map_err(|_| CoordinatorError::Stopped)
    }

    pub fn ready(&self, window: WindowId) -> Result<(), CoordinatorError> {
        self.command(Command::Ready { window })
    }

    pub fn request_channel(&self, window: WindowId) -> Result<(), CoordinatorError> {
        self.command(Command::RequestChannel { window })
    }

    pub fn close(&self, window: WindowId) -> Result<(), CoordinatorError> {
        self.command(Command::Close { window })
    }

    pub async fn status(&self) -> Result<CoordinatorStatus, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Status { reply })?;
        rx.await.map_err(|_| CoordinatorError::Stopped)
    }

    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Shutdown { reply })?;
        rx.await.map_err(|_| CoordinatorError::Stopped)
    }

    /// Register a window, wire a `ClientBridge` to it and signal ready.
    pub async fn open_client(&self) -> Result<ClientSession, CoordinatorError> {
        let (window, assignments) = self.register_session().await?;
        let bridge = ClientBridge::new(Arc::new(WindowPortRequester {
            handle: self.clone(),
            window,
        }));
        let binding = bridge.bind(assignments);
        self.ready(window)?;
        Ok(ClientSession {
            window,
            bridge,
            binding,
        })
    }
}

struct WindowPortRequester {
    handle: CoordinatorHandle,
    window: WindowId,
}

impl PortRequester for WindowPortRequester {
    fn request_port(&self) {
        if self.handle.request_channel(self.window).is_err() {
            tracing::warn!(window = %self.window, "Coordinator stopped, port request dropped");
        }
    }
}

/// A client window wired to the coordinator.
pub struct ClientSession {
    pub window: WindowId,
    pub bridge: ClientBridge,
    binding: JoinHandle<()>,
}

impl ClientSession {
    pub fn close(self, handle: &CoordinatorHandle) -> Result<(), CoordinatorError> {
        self.binding.abort();
        handle.close(self.window)
    }
}
