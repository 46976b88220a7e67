//! Shared utilities for integration tests.
//!
//! Tests place sockets on fixed descriptor numbers, the way a supervisor
//! would before exec'ing the worker. Each test uses its own high range so
//! tests running in parallel never touch each other's slots.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use master_service::net::{AcceptError, Listener};
use master_service::LifecycleCoordinator;
use tokio::io::AsyncReadExt;

/// Move `fd` to slot `target`, closing the original.
pub fn move_fd(fd: RawFd, target: RawFd) {
    nix::unistd::dup2(fd, target).unwrap();
    nix::unistd::close(fd).unwrap();
}

/// Make sure `slot` is not open.
pub fn clear_slot(slot: RawFd) {
    let _ = nix::unistd::close(slot);
}

/// Bind a loopback TCP listener and park it on `slot`.
pub fn inherit_tcp_listener(slot: RawFd) -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    move_fd(listener.into_raw_fd(), slot);
    addr
}

/// Park a regular file on `slot`.
pub fn inherit_regular_file(slot: RawFd) {
    let file = tempfile::tempfile().unwrap();
    move_fd(file.into_raw_fd(), slot);
}

/// Park a UDP socket on `slot`.
pub fn inherit_udp_socket(slot: RawFd) {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    move_fd(socket.into_raw_fd(), slot);
}

/// Create a control socket pair, park the worker end on `slot` and return
/// the supervisor end.
pub fn inherit_control_channel(slot: RawFd) -> std::os::unix::net::UnixStream {
    let (worker, supervisor) = std::os::unix::net::UnixStream::pair().unwrap();
    assert_ne!(worker.as_raw_fd(), slot);
    move_fd(worker.into_raw_fd(), slot);
    supervisor
}

/// Accept until the listener closes; each connection is counted until the
/// peer hangs up.
pub async fn serve_until_closed(listener: Listener, coordinator: Arc<LifecycleCoordinator>) {
    loop {
        let accepted = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(AcceptError::Closed) => break,
            Err(AcceptError::Io(_)) => {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let guard = coordinator.connection_guard();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            if let master_service::net::Accepted::Tcp(mut stream, _) = accepted {
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                }
            }
            drop(guard);
        });
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F: Fn() -> bool>(check: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
