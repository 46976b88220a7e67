//! Shutdown coordination driven by the supervisor.
//!
//! # States
//! ```text
//! Running ──(control EOF / data / error)──▶ Draining ──(count 0 / deadline)──▶ Exiting
//! ```
//!
//! # Design Decisions
//! - The control read is the only wait while running; nothing polls
//! - Draining polls the connection counter once per interval
//! - The deadline is converted to poll ticks (rounded up) and checked after
//!   each sleep, so a deadline of N seconds never forces the exit early
//! - Without a stop hook the listening sockets are shut down, not just flagged
//! - The monitor never exits the process itself; the exit callback does

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

use crate::lifecycle::coordinator::{LifecycleCoordinator, MonitorState};
use crate::lifecycle::hooks::{Hook, HookPoint};
use crate::net::ListenerCloser;
use crate::observability::metrics;

/// How draining ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every connection closed.
    Drained { waited_secs: u64 },
    /// The deadline passed with connections still open.
    DeadlineExceeded { waited_secs: u64, remaining: u64 },
}

/// Watches the supervisor control channel and drains the service once it
/// signals.
#[derive(Debug)]
pub struct ShutdownMonitor {
    coordinator: Arc<LifecycleCoordinator>,
    closer: ListenerCloser,
    on_stop: Option<Hook>,
}

impl ShutdownMonitor {
    pub fn new(coordinator: Arc<LifecycleCoordinator>, closer: ListenerCloser) -> Self {
        Self {
            coordinator,
            closer,
            on_stop: None,
        }
    }

    /// Run `f` when draining starts instead of closing the listeners.
    ///
    /// The hook is then responsible for stopping new accepts.
    pub fn on_stop<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_stop = Some(Hook::new(f));
        self
    }

    /// Run the monitor on a spawned task.
    pub fn spawn<R, F>(self, control: R, exit: F) -> JoinHandle<Option<DrainOutcome>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        F: FnOnce(bool) + Send + 'static,
    {
        tokio::spawn(self.run(control, exit))
    }

    /// Wait for the supervisor, drain, then call `exit(true)`.
    ///
    /// Returns `None` without doing anything if a monitor already ran for
    /// this coordinator.
    pub async fn run<R, F>(self, mut control: R, exit: F) -> Option<DrainOutcome>
    where
        R: AsyncRead + Unpin,
        F: FnOnce(bool),
    {
        if !self.coordinator.claim_monitor() {
            tracing::warn!("Shutdown monitor already started, ignoring");
            return None;
        }

        tracing::info!("Waiting for supervisor to disconnect");
        wait_for_master(&mut control).await;

        self.begin_draining();
        let outcome = self.drain().await;

        self.coordinator.set_state(MonitorState::Exiting);
        tracing::info!(outcome = ?outcome, "Supervisor gone, exiting");
        self.coordinator.hooks().run(HookPoint::PostDrain);
        exit(true);

        Some(outcome)
    }

    fn begin_draining(&self) {
        self.coordinator.mark_stopping();
        self.coordinator.set_state(MonitorState::Draining);

        match &self.on_stop {
            Some(hook) => hook.call(),
            None => {
                tracing::info!("No stop hook registered, closing listeners");
                self.closer.close_all();
            }
        }
    }

    async fn drain(&self) -> DrainOutcome {
        let settings = self.coordinator.settings();
        let deadline = settings.drain_deadline_ticks();
        let counter = self.coordinator.counter();
        let mut ticks = 0u64;
        let mut waited = Duration::ZERO;

        loop {
            let clients = counter.snapshot();
            if clients == 0 {
                return DrainOutcome::Drained {
                    waited_secs: waited.as_secs(),
                };
            }

            tokio::time::sleep(settings.poll_interval).await;
            ticks += 1;
            waited += settings.poll_interval;
            tracing::info!(clients, sleep = ?waited, "Draining, waiting for clients to close");

            if let Some(limit) = deadline {
                if ticks >= limit {
                    let remaining = counter.snapshot();
                    tracing::warn!(
                        deadline_secs = settings.drain_deadline_secs,
                        remaining,
                        "Drain deadline reached, forcing exit"
                    );
                    metrics::record_forced_drain();
                    return DrainOutcome::DeadlineExceeded {
                        waited_secs: waited.as_secs(),
                        remaining,
                    };
                }
            }
        }
    }
}

/// Block until the supervisor closes the channel, writes to it, or the read
/// fails. All three mean "stop now".
async fn wait_for_master<R: AsyncRead + Unpin>(control: &mut R) {
    let mut buf = [0u8; 1024];
    match control.read(&mut buf).await {
        Ok(0) => tracing::info!("Supervisor disconnected"),
        Ok(n) => tracing::info!(bytes = n, "Supervisor sent stop data"),
        Err(e) => tracing::warn!(error = %e, "Control channel error, treating as disconnect"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::coordinator::LifecycleSettings;
    use crate::net::{acquire_listeners, AcquireMode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::time::Instant;

    async fn closer() -> ListenerCloser {
        acquire_listeners(&AcquireMode::Standalone {
            addresses: Vec::new(),
        })
        .await
        .unwrap()
        .closer()
    }

    fn coordinator(deadline_secs: i64) -> Arc<LifecycleCoordinator> {
        Arc::new(LifecycleCoordinator::new(LifecycleSettings {
            drain_deadline_secs: deadline_secs,
            ..Default::default()
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn idle_service_exits_right_after_disconnect() {
        let coordinator = coordinator(10);
        let (control, supervisor) = tokio::io::duplex(64);
        let exits = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&exits);

        let handle = coordinator.monitor(closer().await).spawn(control, move |now| {
            assert!(now);
            e.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.state(), MonitorState::Running);
        assert!(!coordinator.is_stopping());

        let start = Instant::now();
        drop(supervisor);
        let outcome = handle.await.unwrap();

        assert_eq!(outcome, Some(DrainOutcome::Drained { waited_secs: 0 }));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.state(), MonitorState::Exiting);
    }

    #[tokio::test(start_paused = true)]
    async fn data_on_control_channel_also_stops() {
        let coordinator = coordinator(10);
        let (control, mut supervisor) = tokio::io::duplex(64);

        let handle = coordinator.monitor(closer().await).spawn(control, |_| {});
        supervisor.write_all(b"stop").await.unwrap();

        assert!(handle.await.unwrap().is_some());
        assert!(coordinator.is_stopping());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_forces_exit_between_n_and_n_plus_one_ticks() {
        let coordinator = coordinator(3);
        let _stuck = coordinator.connection_guard();

        let start = Instant::now();
        let outcome = coordinator
            .monitor(closer().await)
            .run(tokio::io::empty(), |_| {})
            .await;
        let elapsed = start.elapsed();

        assert_eq!(
            outcome,
            Some(DrainOutcome::DeadlineExceeded {
                waited_secs: 3,
                remaining: 1
            })
        );
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn non_positive_deadline_waits_for_last_connection() {
        let coordinator = coordinator(0);
        let guard = coordinator.connection_guard();

        let handle = coordinator
            .monitor(closer().await)
            .spawn(tokio::io::empty(), |_| {});

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!handle.is_finished());
        assert_eq!(coordinator.state(), MonitorState::Draining);

        drop(guard);
        assert!(matches!(
            handle.await.unwrap(),
            Some(DrainOutcome::Drained { waited_secs }) if waited_secs >= 30
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_hook_replaces_listener_close() {
        let coordinator = coordinator(10);
        let closer = closer().await;
        let stops = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&stops);

        coordinator
            .monitor(closer.clone())
            .on_stop(move || {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .run(tokio::io::empty(), |_| {})
            .await;

        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(!closer.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn without_stop_hook_listeners_are_closed() {
        let coordinator = coordinator(10);
        let closer = closer().await;

        coordinator
            .monitor(closer.clone())
            .run(tokio::io::empty(), |_| {})
            .await;

        assert!(closer.is_closed());
    }

    #[tokio::test]
    async fn without_stop_hook_new_connections_are_refused() {
        let coordinator = coordinator(10);
        let set = acquire_listeners(&AcquireMode::Standalone {
            addresses: vec!["127.0.0.1:0".to_string()],
        })
        .await
        .unwrap();
        let addr = match set.iter().next().unwrap().local_addr().unwrap() {
            crate::net::ListenerAddr::Tcp(addr) => addr,
            other => panic!("expected tcp listener, got {}", other),
        };
        assert!(tokio::net::TcpStream::connect(addr).await.is_ok());

        let outcome = coordinator
            .monitor(set.closer())
            .run(tokio::io::empty(), |_| {})
            .await;

        assert_eq!(outcome, Some(DrainOutcome::Drained { waited_secs: 0 }));
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_holds_with_short_poll_interval() {
        let coordinator = Arc::new(LifecycleCoordinator::new(LifecycleSettings {
            drain_deadline_secs: 3,
            poll_interval: Duration::from_millis(500),
            ..Default::default()
        }));
        let _stuck = coordinator.connection_guard();

        let start = Instant::now();
        let outcome = coordinator
            .monitor(closer().await)
            .run(tokio::io::empty(), |_| {})
            .await;
        let elapsed = start.elapsed();

        assert_eq!(
            outcome,
            Some(DrainOutcome::DeadlineExceeded {
                waited_secs: 3,
                remaining: 1
            })
        );
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_millis(3500));
    }

    #[tokio::test(start_paused = true)]
    async fn post_drain_hook_runs_before_exit() {
        let coordinator = coordinator(10);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        coordinator
            .hooks()
            .on_post_drain(move || o.lock().unwrap().push("post-drain"));

        let o = Arc::clone(&order);
        coordinator
            .monitor(closer().await)
            .run(tokio::io::empty(), move |_| o.lock().unwrap().push("exit"))
            .await;

        assert_eq!(*order.lock().unwrap(), vec!["post-drain", "exit"]);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_runs_once() {
        let coordinator = coordinator(10);
        let exits = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let e = Arc::clone(&exits);
            coordinator
                .monitor(closer().await)
                .run(tokio::io::empty(), move |_| {
                    e.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }

        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }
}
