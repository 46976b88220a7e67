//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events, stderr or master_log file)
//!     → metrics.rs (connection gauge, underflow/forced-drain counters)
//!
//! Consumers:
//!     → Supervisor log file
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Design Decisions
//! - Structured fields on every lifecycle event (fd, count, elapsed)
//! - Metrics are cheap (facade calls, no-op without a recorder)

pub mod logging;
pub mod metrics;
