//! In-flight connection accounting.
//!
//! # Responsibilities
//! - Count connections between accept and full close
//! - Generate unique connection IDs for tracing
//! - Give the shutdown monitor a consistent snapshot to drain against
//!
//! # Design Decisions
//! - One read-write lock guards the count: increment/decrement take the
//!   exclusive side, snapshots take the shared side
//! - Decrementing at zero is a caller bug; the count is clamped and the
//!   underflow is recorded instead of going negative

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Number of connections currently being served.
///
/// Shared between every serving task and the shutdown monitor. Callers either
/// pair [`increment`](Self::increment) / [`decrement`](Self::decrement)
/// themselves or hold a [`ConnectionGuard`] from [`track`](Self::track).
#[derive(Debug, Default)]
pub struct ConnectionCounter {
    count: RwLock<u64>,
    underflows: AtomicU64,
}

impl ConnectionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly accepted connection.
    pub fn increment(&self) {
        let mut count = self.count.write().unwrap_or_else(PoisonError::into_inner);
        *count += 1;
        metrics::record_active_connections(*count);
    }

    /// Record a fully closed connection.
    ///
    /// Returns `false` if the count was already zero. The count then stays at
    /// zero and the underflow is logged and counted.
    pub fn decrement(&self) -> bool {
        let mut count = self.count.write().unwrap_or_else(PoisonError::into_inner);
        if *count == 0 {
            drop(count);
            let total = self.underflows.fetch_add(1, Ordering::Relaxed) + 1;
            metrics::record_connection_underflow();
            tracing::error!(
                underflows = total,
                "Connection count decremented below zero, clamping to 0"
            );
            return false;
        }
        *count -= 1;
        metrics::record_active_connections(*count);
        true
    }

    /// Current number of in-flight connections.
    pub fn snapshot(&self) -> u64 {
        *self.count.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of unpaired decrements observed so far.
    pub fn underflows(&self) -> u64 {
        self.underflows.load(Ordering::Relaxed)
    }

    /// Record a new connection. Returns a guard that decrements on drop.
    pub fn track(self: &Arc<Self>) -> ConnectionGuard {
        self.increment();
        let id = ConnectionId::new();
        tracing::trace!(connection_id = %id, "Connection opened");
        ConnectionGuard {
            counter: Arc::clone(self),
            id,
        }
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements the counter exactly once when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    counter: Arc<ConnectionCounter>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.decrement();
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}
