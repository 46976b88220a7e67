//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber once per process
//! - Route output to the configured log file, or stderr
//! - Pick the log level from the environment or the verbose flag
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - `RUST_LOG` always wins over the verbose flag
//! - A log file that cannot be opened is reported and stderr is kept

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging settings resolved from arguments and configuration.
#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    /// Append log output to this file instead of stderr.
    pub log_path: Option<PathBuf>,
    /// Lower the default level to `debug`.
    pub verbose: bool,
}

impl LoggingOptions {
    fn default_filter(&self) -> &'static str {
        if self.verbose {
            "master_service=debug"
        } else {
            "master_service=info"
        }
    }
}

/// Install the global subscriber.
///
/// Returns `false` if a subscriber was already installed.
pub fn init_logging(options: &LoggingOptions) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| options.default_filter().into());

    let file = options.log_path.as_ref().and_then(|path| match open_log_file(path) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("OpenFile {} error {}", path.display(), e);
            None
        }
    });

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match file {
        Some(file) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
            .try_init(),
        None => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };
    installed.is_ok()
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .append(true)
        .open(path)
}
