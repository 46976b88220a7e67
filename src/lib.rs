//! Lifecycle library for workers run under a supervising master process.
//!
//! The supervisor binds the listening sockets, forks the worker and hands the
//! sockets over as inherited descriptors, together with a control channel on
//! a fixed descriptor. This crate lets the worker:
//! - adopt those listeners (or bind its own when running alone)
//! - drop privileges once the sockets are in hand
//! - drain in-flight connections when the supervisor closes the control
//!   channel, then exit
//!
//! ```text
//!  supervisor ──fd 5──▶ ShutdownMonitor ──▶ drain (ConnectionCounter) ──▶ exit
//!             ──fd 6+─▶ ListenerSet ──▶ accept loops (embedding service)
//! ```

pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::{ServiceArgs, ServiceConfig};
pub use lifecycle::{LifecycleCoordinator, LifecycleSettings, ShutdownMonitor};
pub use net::{acquire_listeners, AcquireMode, ConnectionCounter, ListenerSet};
