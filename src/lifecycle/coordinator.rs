//! Per-process lifecycle state.
//!
//! One [`LifecycleCoordinator`] is built at startup and shared as an `Arc`
//! with the serving tasks and the shutdown monitor. It owns the connection
//! counter, the hook registry, the stopping flag and the monitor state.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::lifecycle::hooks::{HookPoint, LifecycleHooks};
use crate::lifecycle::privilege::{
    IdentityConfig, IdentityOps, PrivilegeDropper, PrivilegeReport, SkipReason,
};
use crate::lifecycle::shutdown::ShutdownMonitor;
use crate::lifecycle::startup::{Startup, StartupError};
use crate::net::{
    acquire_listeners, AcquireMode, ConnectionCounter, ConnectionGuard, ListenerCloser,
    CONTROL_FD, LISTEN_FD_START,
};
use crate::observability::metrics;

/// Shutdown monitor state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Waiting on the control channel.
    Running = 0,
    /// Intake stopped, waiting for in-flight connections.
    Draining = 1,
    /// Exit callback invoked. Terminal.
    Exiting = 2,
}

impl From<u8> for MonitorState {
    fn from(val: u8) -> Self {
        match val {
            1 => MonitorState::Draining,
            2 => MonitorState::Exiting,
            _ => MonitorState::Running,
        }
    }
}

/// Tunables of the lifecycle, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleSettings {
    /// Seconds to wait for connections to drain; 0 or negative waits forever.
    /// Checked once per poll tick.
    pub drain_deadline_secs: i64,
    /// Time between two drain checks.
    pub poll_interval: Duration,
    /// Descriptor of the supervisor control channel.
    pub control_fd: RawFd,
    /// First inherited listener descriptor.
    pub listen_fd_start: RawFd,
    /// Fail startup when the privilege drop did not fully apply.
    pub strict_privileges: bool,
}

impl LifecycleSettings {
    /// Drain deadline, `None` for no deadline.
    pub fn drain_deadline(&self) -> Option<Duration> {
        u64::try_from(self.drain_deadline_secs)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Drain deadline as a number of poll ticks, rounded up.
    pub fn drain_deadline_ticks(&self) -> Option<u64> {
        let deadline = self.drain_deadline()?;
        let interval = self.poll_interval.as_nanos().max(1);
        let ticks = deadline.as_nanos().div_ceil(interval);
        Some(u64::try_from(ticks).unwrap_or(u64::MAX))
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            drain_deadline_secs: 10,
            poll_interval: Duration::from_secs(1),
            control_fd: CONTROL_FD,
            listen_fd_start: LISTEN_FD_START,
            strict_privileges: false,
        }
    }
}

#[derive(Debug)]
pub struct LifecycleCoordinator {
    settings: LifecycleSettings,
    counter: Arc<ConnectionCounter>,
    hooks: LifecycleHooks,
    stopping: watch::Sender<bool>,
    state: AtomicU8,
    privileges_dropped: AtomicBool,
    monitor_started: AtomicBool,
}

impl LifecycleCoordinator {
    pub fn new(settings: LifecycleSettings) -> Self {
        let (stopping, _) = watch::channel(false);
        Self {
            settings,
            counter: Arc::new(ConnectionCounter::new()),
            hooks: LifecycleHooks::new(),
            stopping,
            state: AtomicU8::new(MonitorState::Running as u8),
            privileges_dropped: AtomicBool::new(false),
            monitor_started: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    pub fn counter(&self) -> &Arc<ConnectionCounter> {
        &self.counter
    }

    pub fn hooks(&self) -> &LifecycleHooks {
        &self.hooks
    }

    /// Count a connection for as long as the returned guard lives.
    pub fn connection_guard(&self) -> ConnectionGuard {
        self.counter.track()
    }

    /// Whether the service has started draining.
    pub fn is_stopping(&self) -> bool {
        *self.stopping.borrow()
    }

    /// Receiver that flips to `true` when draining starts.
    pub fn subscribe_stopping(&self) -> watch::Receiver<bool> {
        self.stopping.subscribe()
    }

    pub fn state(&self) -> MonitorState {
        MonitorState::from(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: MonitorState) {
        self.state.store(state as u8, Ordering::SeqCst);
        metrics::record_state(state);
    }

    pub(crate) fn mark_stopping(&self) {
        self.stopping.send_replace(true);
    }

    /// Returns `true` for the first caller only.
    pub(crate) fn claim_monitor(&self) -> bool {
        !self.monitor_started.swap(true, Ordering::SeqCst)
    }

    /// Drop process privileges with the real system calls.
    pub fn drop_privileges(&self, identity: &IdentityConfig) -> PrivilegeReport {
        self.drop_privileges_with(&PrivilegeDropper::system(), identity)
    }

    /// Drop privileges through `dropper`. Only the first call has any effect.
    pub fn drop_privileges_with<O: IdentityOps>(
        &self,
        dropper: &PrivilegeDropper<O>,
        identity: &IdentityConfig,
    ) -> PrivilegeReport {
        if self.privileges_dropped.swap(true, Ordering::SeqCst) {
            tracing::warn!("Privilege drop already ran, ignoring repeated request");
            return PrivilegeReport::skipped(SkipReason::AlreadyApplied);
        }
        dropper.drop_privileges(identity)
    }

    /// Acquire listeners, then drop privileges with the real system calls.
    pub async fn start(
        &self,
        mode: &AcquireMode,
        identity: &IdentityConfig,
    ) -> Result<Startup, StartupError> {
        self.start_with(mode, identity, &PrivilegeDropper::system())
            .await
    }

    /// Startup sequence: acquire listeners → pre-privilege-drop hook →
    /// privilege drop → post-init hook.
    pub async fn start_with<O: IdentityOps>(
        &self,
        mode: &AcquireMode,
        identity: &IdentityConfig,
        dropper: &PrivilegeDropper<O>,
    ) -> Result<Startup, StartupError> {
        let listeners = acquire_listeners(mode).await?;
        tracing::info!(listeners = listeners.len(), "Listeners acquired");

        self.hooks.run(HookPoint::PrePrivilegeDrop);
        let privileges = self.drop_privileges_with(dropper, identity);

        if self.settings.strict_privileges {
            let failure = privileges
                .failures()
                .next()
                .map(|(step, e)| format!("{}: {}", step, e));
            if let Some(failure) = failure {
                tracing::error!(failure = %failure, "Privilege drop incomplete, aborting startup");
                return Err(StartupError::Privilege(privileges));
            }
        }

        self.hooks.run(HookPoint::PostInit);
        Ok(Startup {
            listeners,
            privileges,
        })
    }

    /// Shutdown monitor bound to this coordinator.
    pub fn monitor(self: &Arc<Self>, closer: ListenerCloser) -> ShutdownMonitor {
        ShutdownMonitor::new(Arc::clone(self), closer)
    }
}

impl Default for LifecycleCoordinator {
    fn default() -> Self {
        Self::new(LifecycleSettings::default())
    }
}
