//! Shared listening socket.
//!
//! # Responsibilities
//! - Bind the listening socket once, in the supervisor
//! - Toggle descriptor inheritance so workers can adopt it across `exec`
//! - Accept connections in workers, enforcing `max_connections`
//!
//! # Design Decisions
//! - socket2 for SO_REUSEADDR / SO_REUSEPORT and an explicit backlog
//! - The acquired permit is held for the connection's lifetime (backpressure)
//! - Adopted descriptors get close-on-exec back so they never leak further

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ListenerConfig;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("invalid bind address `{0}`")]
    Address(String),
    #[error("failed to bind: {0}")]
    Bind(#[source] std::io::Error),
    #[error("file descriptor {fd} is not usable: {source}")]
    Descriptor {
        fd: RawFd,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to accept: {0}")]
    Accept(#[source] std::io::Error),
    #[error("connection limit semaphore closed")]
    Closed,
}

/// Bind the socket every worker will accept on.
pub fn bind_shared(config: &ListenerConfig) -> Result<StdTcpListener, ListenerError> {
    let addr: SocketAddr = config
        .bind_address
        .parse()
        .map_err(|_| ListenerError::Address(config.bind_address.clone()))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(ListenerError::Bind)?;
    socket.set_reuse_address(true).map_err(ListenerError::Bind)?;
    if config.reuse_port {
        socket.set_reuse_port(true).map_err(ListenerError::Bind)?;
    }
    socket.bind(&addr.into()).map_err(ListenerError::Bind)?;
    socket.listen(config.backlog).map_err(ListenerError::Bind)?;

    let listener: StdTcpListener = socket.into();
    tracing::info!(
        address = %listener.local_addr().map_err(ListenerError::Bind)?,
        backlog = config.backlog,
        reuse_port = config.reuse_port,
        "Listening socket bound"
    );
    Ok(listener)
}

/// Set or clear `FD_CLOEXEC` on a descriptor.
pub fn set_inheritable(fd: RawFd, inheritable: bool) -> std::io::Result<()> {
    // SAFETY: fcntl on an fd we do not own only reads/writes its flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let flags = if inheritable {
        flags & !libc::FD_CLOEXEC
    } else {
        flags | libc::FD_CLOEXEC
    };
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Whether `fd` survives `exec`.
pub fn is_inheritable(fd: RawFd) -> std::io::Result<bool> {
    // SAFETY: read-only flag query.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(flags & libc::FD_CLOEXEC == 0)
}

/// Take ownership of a listening socket inherited from the parent process.
pub fn adopt(fd: RawFd) -> Result<StdTcpListener, ListenerError> {
    let descriptor = |source| ListenerError::Descriptor { fd, source };

    // Validates the descriptor before we claim ownership of it.
    set_inheritable(fd, false).map_err(descriptor)?;

    // SAFETY: the parent handed this descriptor to us and nothing else in
    // this process refers to it.
    let listener = unsafe { StdTcpListener::from_raw_fd(fd) };
    let addr = listener.local_addr().map_err(descriptor)?;
    tracing::debug!(fd, address = %addr, "Adopted inherited listening socket");
    Ok(listener)
}

/// A bounded TCP listener that limits concurrent connections.
///
/// When the limit is reached, `accept` waits until a slot becomes available.
pub struct Listener {
    inner: TcpListener,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    /// Bind a fresh socket for a single-process server.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        Self::from_std(bind_shared(config)?, config.max_connections)
    }

    /// Wrap an already-bound socket. Must run inside a Tokio runtime.
    pub fn from_std(listener: StdTcpListener, max_connections: usize) -> Result<Self, ListenerError> {
        listener.set_nonblocking(true).map_err(ListenerError::Bind)?;
        let inner = TcpListener::from_std(listener).map_err(ListenerError::Bind)?;

        tracing::info!(
            address = ?inner.local_addr().ok(),
            fd = inner.as_raw_fd(),
            max_connections,
            "Listener ready"
        );

        Ok(Self {
            inner,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// The returned permit must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        let permit = Arc::clone(&self.connection_limit)
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;

        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer_addr = %addr, error = %e, "Failed to set TCP_NODELAY");
        }

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A connection slot; released when dropped, even if the handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}
