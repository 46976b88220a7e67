//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Supervisor
//!     → fd 5: control.rs (shutdown trigger, read by the shutdown monitor)
//!     → fd 6..6+n: listener.rs (inherited listening sockets)
//!
//! Standalone:
//!     host:port list → listener.rs (fresh binds)
//!
//! Serving:
//!     Listener::accept → connection.rs (counter guard per connection)
//!     → Hand off to the embedding service
//! ```
//!
//! # Design Decisions
//! - Inherited slots are skipped on error, fresh binds fail hard
//! - Each connection is counted for graceful shutdown
//! - Listeners stop accepting as a set when draining starts

pub mod connection;
pub mod control;
pub mod listener;

pub use connection::{ConnectionCounter, ConnectionGuard, ConnectionId};
pub use control::{inherited_control, open_control_channel, ControlReader, CONTROL_FD, LISTEN_FD_START};
pub use listener::{
    acquire_listeners, AcceptError, Accepted, AcquireMode, AcquisitionError, Listener,
    ListenerAddr, ListenerCloser, ListenerSet,
};
