//! OS signal handling for standalone workers.
//!
//! # Responsibilities
//! - Stand in for the supervisor control channel when running alone
//! - Translate SIGTERM/SIGINT into the same "channel closed" event
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - The shutdown monitor stays unaware of where the stop came from

use tokio::io::DuplexStream;
use tokio::signal::unix::{signal, SignalKind};

/// A control reader that reaches end-of-stream on SIGTERM or SIGINT.
///
/// Must be called from within a tokio runtime.
pub fn control_from_signals() -> std::io::Result<DuplexStream> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let (reader, writer) = tokio::io::duplex(64);

    tokio::spawn(async move {
        tokio::select! {
            _ = terminate.recv() => tracing::info!("SIGTERM received"),
            _ = interrupt.recv() => tracing::info!("SIGINT received"),
        }
        drop(writer);
    });

    Ok(reader)
}
