//! Supervisor control channel.
//!
//! The supervisor keeps one end of a stream open on a fixed descriptor for the
//! lifetime of the worker. Closing it, or writing anything to it, tells the
//! worker to stop. There is no framing and no payload.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg};
use tokio::io::AsyncRead;
use tokio::net::UnixStream;

/// Descriptor carrying the control channel.
pub const CONTROL_FD: RawFd = 5;

/// First inherited listener descriptor.
pub const LISTEN_FD_START: RawFd = CONTROL_FD + 1;

/// Open the inherited control descriptor as an async byte stream.
///
/// Must be called from within a tokio runtime. Takes ownership of `fd`.
pub fn open_control_channel(fd: RawFd) -> std::io::Result<UnixStream> {
    fcntl(fd, FcntlArg::F_GETFD).map_err(std::io::Error::from)?;

    // SAFETY: the descriptor is open and reserved for the control channel;
    // this is its only owner.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    let stream = std::os::unix::net::UnixStream::from(owned);
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}

/// Boxed control channel reader.
pub type ControlReader = Box<dyn AsyncRead + Unpin + Send>;

/// Open the inherited control channel, or an always-closed reader if the
/// descriptor is unusable. A broken channel therefore stops the worker.
pub fn inherited_control(fd: RawFd) -> ControlReader {
    match open_control_channel(fd) {
        Ok(stream) => Box::new(stream),
        Err(e) => {
            tracing::error!(fd, error = %e, "Control channel unusable, treating it as closed");
            Box::new(tokio::io::empty())
        }
    }
}
