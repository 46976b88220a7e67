//! Echo worker built on the lifecycle library.
//!
//! Run under a supervisor, it adopts the inherited listeners on fd 6+ and
//! stops when fd 5 closes. With `--alone -l host:port` it binds its own
//! listeners and stops on SIGTERM/SIGINT.
//!
//! # Flow
//! ```text
//! args → prepare (config, logging)
//!      → start (listeners → pre-privilege-drop → drop → post-init)
//!      → accept loops, one task per connection
//!      → shutdown monitor → drain → exit
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncRead, AsyncWrite};

use master_service::lifecycle::{control_from_signals, prepare};
use master_service::net::{inherited_control, AcceptError, Accepted, ControlReader, Listener};
use master_service::observability::metrics;
use master_service::{LifecycleCoordinator, ServiceArgs};

/// Pause before retrying a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let prepared = prepare(ServiceArgs::parse())?;

    if let Some(addr) = prepared.metrics_address() {
        metrics::init_metrics(addr);
    }

    let coordinator = Arc::new(LifecycleCoordinator::new(prepared.settings.clone()));
    coordinator
        .hooks()
        .on_post_drain(|| tracing::info!("Echo worker drained"));

    let startup = coordinator
        .start(&prepared.mode, &prepared.identity)
        .await?;
    if startup.privileges.is_degraded() {
        tracing::warn!("Running with the original process identity");
    }

    let closer = startup.listeners.closer();
    for listener in startup.listeners.into_listeners() {
        tokio::spawn(accept_loop(listener, Arc::clone(&coordinator)));
    }

    let control: ControlReader = if prepared.args.alone {
        Box::new(control_from_signals()?)
    } else {
        inherited_control(coordinator.settings().control_fd)
    };

    coordinator
        .monitor(closer)
        .run(control, |_| std::process::exit(0))
        .await;

    Ok(())
}

async fn accept_loop(listener: Listener, coordinator: Arc<LifecycleCoordinator>) {
    let addr = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    tracing::info!(address = %addr, "Accepting connections");

    while let Some(accepted) = next_connection(|| listener.accept(), &addr).await {
        let guard = coordinator.connection_guard();
        tracing::debug!(connection_id = %guard.id(), peer = %accepted.peer(), "Connection accepted");
        tokio::spawn(async move {
            let result = match accepted {
                Accepted::Tcp(stream, _) => echo(stream).await,
                Accepted::Unix(stream) => echo(stream).await,
            };
            if let Err(e) = result {
                tracing::debug!(connection_id = %guard.id(), error = %e, "Connection error");
            }
            drop(guard);
        });
    }

    tracing::info!(address = %addr, "Listener closed");
}

/// Wait for the next connection, backing off after each accept error.
///
/// Returns `None` once the listener is closed.
async fn next_connection<F, Fut>(accept: F, addr: &str) -> Option<Accepted>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Accepted, AcceptError>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return Some(accepted),
            Err(AcceptError::Closed) => return None,
            Err(AcceptError::Io(e)) => {
                tracing::warn!(address = %addr, error = %e, delay = ?ACCEPT_BACKOFF, "Accept failed, backing off");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn echo<S: AsyncRead + AsyncWrite>(stream: S) -> std::io::Result<u64> {
    let (mut reader, mut writer) = tokio::io::split(stream);
    tokio::io::copy(&mut reader, &mut writer).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn accept_errors_back_off_before_retrying() {
        let attempts = &AtomicUsize::new(0);
        let start = Instant::now();

        let accepted = next_connection(
            move || async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(AcceptError::Io(std::io::Error::from_raw_os_error(24)))
                } else {
                    Err(AcceptError::Closed)
                }
            },
            "test",
        )
        .await;

        assert!(accepted.is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert!(start.elapsed() >= ACCEPT_BACKOFF * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_listener_stops_without_waiting() {
        let start = Instant::now();
        let accepted = next_connection(|| async { Err(AcceptError::Closed) }, "test").await;

        assert!(accepted.is_none());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
