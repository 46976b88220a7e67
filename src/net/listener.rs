//! Listener acquisition.
//!
//! # Responsibilities
//! - Adopt listening sockets inherited from the supervisor
//! - Bind fresh listeners when running standalone
//! - Close every listener on demand when the service starts draining
//!
//! # Design Decisions
//! - Inherited descriptors were validated by the supervisor: a bad slot is
//!   logged and skipped, never fatal
//! - Standalone binds have no fallback: the first failure aborts acquisition
//!   and drops whatever was already bound
//! - Closing a set shuts down the listening sockets themselves, so the kernel
//!   refuses new connections even while a `Listener` is still held
//! - Order of the returned set follows descriptor order or address order

use std::fmt;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use nix::fcntl::{fcntl, FcntlArg};
use socket2::{Domain, SockRef, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::watch;

/// How the worker obtains its listening sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireMode {
    /// Adopt `count` descriptors starting at `base_fd`.
    Inherited { base_fd: RawFd, count: usize },
    /// Bind each `host:port` address.
    Standalone { addresses: Vec<String> },
}

/// Fatal acquisition failure.
#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("Failed to listen on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// Why an inherited descriptor could not be adopted.
#[derive(Debug, thiserror::Error)]
pub enum InheritError {
    #[error("descriptor is not open: {0}")]
    NotOpen(nix::Error),
    #[error("descriptor is not a socket: {0}")]
    NotSocket(std::io::Error),
    #[error("socket is not a stream socket")]
    NotStream,
    #[error("socket is not listening")]
    NotListening,
    #[error("unsupported socket family {0:?}")]
    UnsupportedFamily(Domain),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Failure to accept on a listener.
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    /// The listener set was closed because the service is draining.
    #[error("listener closed")]
    Closed,
    #[error("Failed to accept: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
enum ListenerKind {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl ListenerKind {
    /// Stop the socket from listening; pending and future connects are refused.
    fn shutdown(&self) -> std::io::Result<()> {
        let socket = match self {
            ListenerKind::Tcp(listener) => SockRef::from(listener),
            ListenerKind::Unix(listener) => SockRef::from(listener),
        };
        socket.shutdown(std::net::Shutdown::Read)
    }
}

/// Address a listener is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerAddr {
    Tcp(SocketAddr),
    Unix(Option<PathBuf>),
}

impl fmt::Display for ListenerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerAddr::Tcp(addr) => write!(f, "tcp://{}", addr),
            ListenerAddr::Unix(Some(path)) => write!(f, "unix:{}", path.display()),
            ListenerAddr::Unix(None) => write!(f, "unix:(unnamed)"),
        }
    }
}

/// An accepted connection.
#[derive(Debug)]
pub enum Accepted {
    Tcp(TcpStream, SocketAddr),
    Unix(UnixStream),
}

impl Accepted {
    /// Printable peer address for logging.
    pub fn peer(&self) -> String {
        match self {
            Accepted::Tcp(_, addr) => addr.to_string(),
            Accepted::Unix(_) => "unix".to_string(),
        }
    }
}

/// A passively listening socket, ready to accept.
#[derive(Debug)]
pub struct Listener {
    kind: Arc<ListenerKind>,
    closed: watch::Receiver<bool>,
}

impl Listener {
    /// Accept a new connection.
    ///
    /// Returns [`AcceptError::Closed`] once the owning set has been closed;
    /// the caller should then drop the listener to release the descriptor.
    pub async fn accept(&self) -> Result<Accepted, AcceptError> {
        let mut closed = self.closed.clone();
        if *closed.borrow_and_update() {
            return Err(AcceptError::Closed);
        }

        let accept = async {
            let result = match self.kind.as_ref() {
                ListenerKind::Tcp(listener) => listener
                    .accept()
                    .await
                    .map(|(stream, addr)| Accepted::Tcp(stream, addr)),
                ListenerKind::Unix(listener) => listener
                    .accept()
                    .await
                    .map(|(stream, _)| Accepted::Unix(stream)),
            };
            // A shut down socket fails its accept; report that as the close.
            result.map_err(|e| {
                if self.is_closed() {
                    AcceptError::Closed
                } else {
                    AcceptError::Io(e)
                }
            })
        };

        // A dropped closer can never close the set, so it must not end the accept.
        let close_signal = async {
            if closed.wait_for(|closed| *closed).await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            accepted = accept => accepted,
            _ = close_signal => Err(AcceptError::Closed),
        }
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<ListenerAddr> {
        match self.kind.as_ref() {
            ListenerKind::Tcp(listener) => listener.local_addr().map(ListenerAddr::Tcp),
            ListenerKind::Unix(listener) => listener
                .local_addr()
                .map(|addr| ListenerAddr::Unix(addr.as_pathname().map(PathBuf::from))),
        }
    }

    /// Whether the owning set has been closed.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Handle that closes every listener of a [`ListenerSet`].
#[derive(Debug, Clone)]
pub struct ListenerCloser {
    tx: Arc<watch::Sender<bool>>,
    // Weak so a listener dropped by its accept loop is released right away.
    sockets: Arc<Mutex<Vec<Weak<ListenerKind>>>>,
}

impl ListenerCloser {
    /// Stop every listener of the set from accepting.
    ///
    /// Marks the set closed, which ends pending and future
    /// [`Listener::accept`] calls, then shuts down each socket still alive so
    /// the kernel stops queuing connections. Later calls do nothing.
    pub fn close_all(&self) {
        if self.tx.send_replace(true) {
            return;
        }

        let sockets = self.sockets.lock().unwrap_or_else(PoisonError::into_inner);
        let mut closed = 0usize;
        for socket in sockets.iter().filter_map(Weak::upgrade) {
            match socket.shutdown() {
                Ok(()) => closed += 1,
                Err(e) => tracing::warn!(error = %e, "Failed to shut down listener"),
            }
        }
        tracing::info!(closed, "Listeners closed");
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Ordered set of acquired listeners.
#[derive(Debug)]
pub struct ListenerSet {
    listeners: Vec<Listener>,
    closer: ListenerCloser,
}

impl ListenerSet {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            listeners: Vec::new(),
            closer: ListenerCloser {
                tx: Arc::new(tx),
                sockets: Arc::new(Mutex::new(Vec::new())),
            },
        }
    }

    fn push(&mut self, kind: ListenerKind) {
        let kind = Arc::new(kind);
        self.closer
            .sockets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&kind));
        let closed = self.closer.tx.subscribe();
        self.listeners.push(Listener { kind, closed });
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Listener> {
        self.listeners.iter()
    }

    /// Handle for closing the whole set later.
    pub fn closer(&self) -> ListenerCloser {
        self.closer.clone()
    }

    /// Take ownership of the listeners, e.g. to move each into its accept loop.
    pub fn into_listeners(self) -> Vec<Listener> {
        self.listeners
    }
}

/// Acquire the listening sockets for this worker.
///
/// Must be called from within a tokio runtime.
pub async fn acquire_listeners(mode: &AcquireMode) -> Result<ListenerSet, AcquisitionError> {
    match mode {
        AcquireMode::Inherited { base_fd, count } => Ok(acquire_inherited(*base_fd, *count)),
        AcquireMode::Standalone { addresses } => acquire_standalone(addresses).await,
    }
}

fn acquire_inherited(base_fd: RawFd, count: usize) -> ListenerSet {
    let mut set = ListenerSet::new();
    for offset in 0..count {
        let fd = base_fd + offset as RawFd;
        match listener_from_fd(fd) {
            Ok(kind) => {
                set.push(kind);
                tracing::info!(fd, "Adopted inherited listener");
            }
            Err(e) => {
                tracing::warn!(fd, error = %e, "Inherited descriptor is not a usable listener, skipping");
            }
        }
    }
    set
}

async fn acquire_standalone(addresses: &[String]) -> Result<ListenerSet, AcquisitionError> {
    let mut set = ListenerSet::new();
    for address in addresses {
        let listener = TcpListener::bind(address.as_str())
            .await
            .map_err(|source| AcquisitionError::Bind {
                address: address.clone(),
                source,
            })?;
        if let Ok(local_addr) = listener.local_addr() {
            tracing::info!(address = %local_addr, "Listener bound");
        }
        set.push(ListenerKind::Tcp(listener));
    }
    Ok(set)
}

/// Convert one inherited descriptor into a listener.
///
/// Ownership of the descriptor is only taken once it is known to be open, so
/// an empty slot is never closed. An open descriptor that fails conversion is
/// closed on return.
fn listener_from_fd(fd: RawFd) -> Result<ListenerKind, InheritError> {
    fcntl(fd, FcntlArg::F_GETFD).map_err(InheritError::NotOpen)?;

    // SAFETY: the descriptor is open and was handed to this process by the
    // supervisor for exclusive use; nothing else in the process owns it.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    let socket = Socket::from(owned);

    if socket.r#type().map_err(InheritError::NotSocket)? != Type::STREAM {
        return Err(InheritError::NotStream);
    }

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        if !socket.is_listener()? {
            return Err(InheritError::NotListening);
        }
    }

    let domain = socket.local_addr()?.domain();
    socket.set_nonblocking(true)?;

    if domain == Domain::IPV4 || domain == Domain::IPV6 {
        let std_listener = std::net::TcpListener::from(socket);
        Ok(ListenerKind::Tcp(TcpListener::from_std(std_listener)?))
    } else if domain == Domain::UNIX {
        let std_listener = std::os::unix::net::UnixListener::from(socket);
        Ok(ListenerKind::Unix(UnixListener::from_std(std_listener)?))
    } else {
        Err(InheritError::UnsupportedFamily(domain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;

    #[tokio::test]
    async fn standalone_binds_in_order() {
        let mode = AcquireMode::Standalone {
            addresses: vec!["127.0.0.1:0".to_string(), "127.0.0.1:0".to_string()],
        };
        let set = acquire_listeners(&mode).await.unwrap();
        assert_eq!(set.len(), 2);
        for listener in set.iter() {
            assert!(matches!(listener.local_addr().unwrap(), ListenerAddr::Tcp(_)));
        }
    }

    #[tokio::test]
    async fn standalone_bind_failure_is_fatal() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken_addr = taken.local_addr().unwrap().to_string();
        let mode = AcquireMode::Standalone {
            addresses: vec!["127.0.0.1:0".to_string(), taken_addr.clone()],
        };

        match acquire_listeners(&mode).await {
            Err(AcquisitionError::Bind { address, .. }) => assert_eq!(address, taken_addr),
            other => panic!("expected bind error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn closed_set_rejects_accept() {
        let mode = AcquireMode::Standalone {
            addresses: vec!["127.0.0.1:0".to_string()],
        };
        let set = acquire_listeners(&mode).await.unwrap();
        let closer = set.closer();
        let listener = set.into_listeners().pop().unwrap();

        let pending = tokio::spawn(async move { listener.accept().await });
        tokio::task::yield_now().await;
        closer.close_all();

        assert!(closer.is_closed());
        assert!(matches!(pending.await.unwrap(), Err(AcceptError::Closed)));
    }

    #[tokio::test]
    async fn closed_set_refuses_connections_while_held() {
        let mode = AcquireMode::Standalone {
            addresses: vec!["127.0.0.1:0".to_string()],
        };
        let set = acquire_listeners(&mode).await.unwrap();
        let addr = match set.iter().next().unwrap().local_addr().unwrap() {
            ListenerAddr::Tcp(addr) => addr,
            other => panic!("expected tcp listener, got {}", other),
        };

        set.closer().close_all();

        // Nobody is accepting and the set is still alive.
        assert!(TcpStream::connect(addr).await.is_err());
        assert!(set.iter().all(Listener::is_closed));
    }

    #[tokio::test]
    async fn close_all_is_repeatable() {
        let mode = AcquireMode::Standalone {
            addresses: vec!["127.0.0.1:0".to_string()],
        };
        let set = acquire_listeners(&mode).await.unwrap();
        let closer = set.closer();
        closer.close_all();
        closer.close_all();
        assert!(closer.is_closed());
    }

    #[tokio::test]
    async fn close_skips_dropped_listeners() {
        let mode = AcquireMode::Standalone {
            addresses: vec!["127.0.0.1:0".to_string(), "127.0.0.1:0".to_string()],
        };
        let set = acquire_listeners(&mode).await.unwrap();
        let closer = set.closer();
        let mut listeners = set.into_listeners();
        let kept = listeners.pop().unwrap();
        drop(listeners);

        closer.close_all();
        assert!(kept.is_closed());
        assert!(matches!(kept.accept().await, Err(AcceptError::Closed)));
    }

    #[tokio::test]
    async fn closed_unix_listener_refuses_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("closing.sock");
        let std_listener = std::os::unix::net::UnixListener::bind(&path).unwrap();

        let set = acquire_inherited(std_listener.into_raw_fd(), 1);
        assert_eq!(set.len(), 1);
        set.closer().close_all();

        assert!(UnixStream::connect(&path).await.is_err());
    }

    #[tokio::test]
    async fn inherited_skips_unopened_descriptor() {
        // Far above anything the test harness opens.
        let set = acquire_inherited(1019, 1);
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn inherited_adopts_unix_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.sock");
        let std_listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let fd = std_listener.into_raw_fd();

        let set = acquire_inherited(fd, 1);
        assert_eq!(set.len(), 1);
        let addr = set.iter().next().unwrap().local_addr().unwrap();
        assert_eq!(addr, ListenerAddr::Unix(Some(path)));
    }

    #[test]
    fn listener_addr_display() {
        let tcp = ListenerAddr::Tcp("127.0.0.1:8080".parse().unwrap());
        assert_eq!(tcp.to_string(), "tcp://127.0.0.1:8080");
        assert_eq!(ListenerAddr::Unix(None).to_string(), "unix:(unnamed)");
    }
}
