//! Startup orchestration.
//!
//! # Responsibilities
//! - Parse-time preparation: load config, initialize logging, derive the
//!   identity, acquisition mode and lifecycle settings
//! - Carry the result of the startup sequence run by the coordinator
//!
//! # Design Decisions
//! - Fail fast on configuration and bind errors
//! - Privilege drop failures are reported, fatal only in strict mode
//! - Listeners are acquired before privileges are dropped

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::config::{load_config, ConfigError, ServiceArgs, ServiceConfig, ValidationError};
use crate::lifecycle::coordinator::LifecycleSettings;
use crate::lifecycle::privilege::{IdentityConfig, PrivilegeReport};
use crate::net::{AcquireMode, AcquisitionError, ListenerSet, LISTEN_FD_START};
use crate::observability::logging::{init_logging, LoggingOptions};

/// Result of [`LifecycleCoordinator::start`](crate::LifecycleCoordinator::start).
#[derive(Debug)]
pub struct Startup {
    pub listeners: ListenerSet,
    pub privileges: PrivilegeReport,
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    #[error("privilege drop incomplete")]
    Privilege(PrivilegeReport),
}

/// Everything the worker needs before the startup sequence runs.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub args: ServiceArgs,
    pub config: ServiceConfig,
    pub identity: IdentityConfig,
    pub mode: AcquireMode,
    pub settings: LifecycleSettings,
}

impl Prepared {
    /// Derive runtime settings from arguments and configuration.
    pub fn from_parts(args: ServiceArgs, config: ServiceConfig) -> Result<Self, ConfigError> {
        let mode = if args.alone {
            let addresses = if args.listen.is_empty() {
                config.listen.clone()
            } else {
                args.listen.clone()
            };
            if addresses.is_empty() {
                return Err(ConfigError::Validation(vec![ValidationError::NoListenAddress]));
            }
            AcquireMode::Standalone { addresses }
        } else {
            AcquireMode::Inherited {
                base_fd: LISTEN_FD_START,
                count: args.socket_count(),
            }
        };

        let identity = IdentityConfig {
            username: non_empty(&config.owner),
            root_dir: non_empty(&config.queue_dir).map(PathBuf::from),
            drop_requested: !config.master_args.is_empty(),
            unprivileged: args.unprivileged,
            chroot: args.chroot,
        };

        let settings = LifecycleSettings {
            drain_deadline_secs: config.wait_exit_secs,
            strict_privileges: config.strict_privileges,
            ..Default::default()
        };

        Ok(Self {
            args,
            config,
            identity,
            mode,
            settings,
        })
    }

    /// Metrics exporter address, if configured.
    pub fn metrics_address(&self) -> Option<SocketAddr> {
        self.config
            .metrics_address
            .as_deref()
            .and_then(|addr| addr.parse().ok())
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Load configuration, initialize logging and derive runtime settings.
pub fn prepare(args: ServiceArgs) -> Result<Prepared, ConfigError> {
    let config = match &args.config_path {
        Some(path) => load_config(path)?,
        None => ServiceConfig::default(),
    };

    init_logging(&LoggingOptions {
        log_path: config.log_path.clone().filter(|p| !p.as_os_str().is_empty()),
        verbose: args.verbose,
    });

    tracing::info!(
        listen_fd_count = args.socket_count(),
        service_type = %args.service_type,
        services = %args.service_name,
        alone = args.alone,
        "Arguments parsed"
    );
    tracing::info!(args = %config.master_args, "Args");

    Prepared::from_parts(args, config)
}
