//! Session channel transport.
//!
//! Every client window gets its own Unix socket connection to the worker. The
//! coordinator binds a one-shot listener, tells the worker where it is, accepts
//! the worker's connection and hands the accepted stream to the client.
//!
//! Platform-specific listeners:
//! - **NamedSocket**: filesystem socket (macOS, Linux, BSD)
//! - **AbstractSocket**: Linux abstract namespace (no filesystem entry, auto-cleanup)

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::net::{UnixListener, UnixStream};

use super::protocol::SessionId;

/// Where the worker connects to reach a session channel. Sent inside the Init frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelInfo {
    NamedSocket { path: PathBuf },
    #[cfg(target_os = "linux")]
    AbstractSocket { name: String },
}

/// Coordinator-side half of a channel that is still waiting for the worker.
///
/// Dropping it removes any filesystem entry it created.
pub struct ChannelListener {
    listener: UnixListener,
    path: Option<PathBuf>,
}

impl ChannelListener {
    /// Wait for the worker to connect. The listener is consumed: a channel has
    /// exactly one worker-side endpoint.
    pub async fn accept(self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        tracing::trace!("Worker connected to session channel");
        Ok(stream)
    }
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        if let Some(path) = self.path.take()
            && let Err(e) = std::fs::remove_file(&path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(error = %e, path = %path.display(), "Failed to remove channel socket");
        }
    }
}

fn socket_dir() -> PathBuf {
    std::env::temp_dir().join(format!("sqlwire-{}", std::process::id()))
}

/// Bind a filesystem socket for one session.
///
/// Path format: `{temp_dir}/sqlwire-{pid}/{session_id}.sock`
pub fn create_named_channel(session_id: SessionId) -> io::Result<(ChannelListener, ChannelInfo)> {
    let dir = socket_dir();
    std::fs::create_dir_all(&dir)?;

    let path = dir.join(format!("{session_id}.sock"));
    if path.exists() {
        std::fs::remove_file(&path)?;
    }

    let std_listener = std::os::unix::net::UnixListener::bind(&path)?;
    std_listener.set_nonblocking(true)?;
    let listener = UnixListener::from_std(std_listener)?;

    tracing::debug!(transport_type = "named", path = %path.display(), %session_id, "Bound channel socket");

    Ok((
        ChannelListener {
            listener,
            path: Some(path.clone()),
        },
        ChannelInfo::NamedSocket { path },
    ))
}

/// Bind an abstract-namespace socket for one session (Linux only).
#[cfg(target_os = "linux")]
pub fn create_abstract_channel(
    session_id: SessionId,
) -> io::Result<(ChannelListener, ChannelInfo)> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::{SocketAddr, UnixListener as StdUnixListener};

    let name = format!("sqlwire-{}-{}", std::process::id(), session_id);
    let addr = SocketAddr::from_abstract_name(name.as_bytes())?;

    let std_listener = StdUnixListener::bind_addr(&addr)?;
    std_listener.set_nonblocking(true)?;
    let listener = UnixListener::from_std(std_listener)?;

    tracing::debug!(transport_type = "abstract", name = %name, %session_id, "Bound channel socket");

    Ok((
        ChannelListener {
            listener,
            path: None,
        },
        ChannelInfo::AbstractSocket { name },
    ))
}

/// Bind a channel using the platform default (abstract on Linux, named elsewhere).
pub fn create_channel(session_id: SessionId) -> io::Result<(ChannelListener, ChannelInfo)> {
    #[cfg(target_os = "linux")]
    {
        create_abstract_channel(session_id)
    }

    #[cfg(not(target_os = "linux"))]
    {
        create_named_channel(session_id)
    }
}

/// Worker side: connect to the channel described by an Init frame.
pub async fn connect_channel(info: &ChannelInfo) -> io::Result<UnixStream> {
    match info {
        ChannelInfo::NamedSocket { path } => {
            tracing::trace!(path = %path.display(), "Connecting to channel socket");
            UnixStream::connect(path).await
        }
        #[cfg(target_os = "linux")]
        ChannelInfo::AbstractSocket { name } => {
            use std::os::linux::net::SocketAddrExt;
            use std::os::unix::net::SocketAddr;

            tracing::trace!(name = %name, "Connecting to abstract channel socket");
            let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
            // tokio doesn't support abstract sockets directly
            let std_stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
            std_stream.set_nonblocking(true)?;
            UnixStream::from_std(std_stream)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn exchange(listener: ChannelListener, info: ChannelInfo) {
        let connect = tokio::spawn(async move { connect_channel(&info).await.unwrap() });
        let mut coordinator_side = listener.accept().await.unwrap();
        let mut worker_side = connect.await.unwrap();

        worker_side.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        coordinator_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn named_channel_connects_and_cleans_up() {
        let (listener, info) = create_named_channel(SessionId::new()).unwrap();
        let ChannelInfo::NamedSocket { path } = info.clone() else {
            panic!("expected named socket");
        };
        assert!(path.exists());

        exchange(listener, info).await;
        assert!(!path.exists(), "socket file removed once the listener is consumed");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn abstract_channel_connects() {
        let (listener, info) = create_abstract_channel(SessionId::new()).unwrap();
        assert!(matches!(info, ChannelInfo::AbstractSocket { .. }));
        exchange(listener, info).await;
    }

    #[test]
    fn channel_info_roundtrips() {
        let info = ChannelInfo::NamedSocket {
            path: PathBuf::from("/tmp/sqlwire-123/a.sock"),
        };
        let json = serde_json::to_string(&info).unwrap();
        let parsed: ChannelInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, info);
    }
}
