//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs, coordinator.rs):
//!     Parse args → Load config → Init logging
//!     → Acquire listeners → pre-privilege-drop hook
//!     → Drop privileges (privilege.rs) → post-init hook → Serve
//!
//! Shutdown (shutdown.rs):
//!     Control channel closed → Stop accepting → Drain connections
//!     → post-drain hook → Exit callback
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Close the standalone control channel
//! ```
//!
//! # Design Decisions
//! - All process-wide state lives in one coordinator shared by `Arc`
//! - Privilege drop and shutdown monitor each run at most once
//! - Shutdown has a deadline: forced exit after it passes

pub mod coordinator;
pub mod hooks;
pub mod privilege;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use coordinator::{LifecycleCoordinator, LifecycleSettings, MonitorState};
pub use hooks::{HookPoint, LifecycleHooks};
pub use privilege::{
    IdentityConfig, IdentityOps, PrivilegeDropper, PrivilegeError, PrivilegeReport, SkipReason,
    Step, StepOutcome, SystemIdentity,
};
pub use shutdown::{DrainOutcome, ShutdownMonitor};
pub use signals::control_from_signals;
pub use startup::{prepare, Prepared, Startup, StartupError};
