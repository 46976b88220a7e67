//! Configuration schema definitions.
//!
//! Keys keep the names the supervisor's service files use (`master_log`,
//! `fiber_owner`, ...). All fields are optional.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for a supervised worker.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceConfig {
    /// File to append log output to.
    #[serde(rename = "master_log")]
    pub log_path: Option<PathBuf>,

    /// Arguments the supervisor passed for this service. Non-empty means the
    /// supervisor expects the worker to drop privileges.
    pub master_args: String,

    /// User to run as after startup.
    #[serde(rename = "fiber_owner")]
    pub owner: String,

    /// Root directory for confinement.
    #[serde(rename = "fiber_queue_dir")]
    pub queue_dir: String,

    /// Seconds to wait for connections to drain; 0 or negative waits forever.
    pub wait_exit_secs: i64,

    /// Addresses to bind when running standalone.
    pub listen: Vec<String>,

    /// Prometheus exporter bind address.
    pub metrics_address: Option<String>,

    /// Abort startup if the privilege drop does not fully apply.
    pub strict_privileges: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            master_args: String::new(),
            owner: String::new(),
            queue_dir: String::new(),
            wait_exit_secs: 10,
            listen: Vec::new(),
            metrics_address: None,
            strict_privileges: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: ServiceConfig = toml::from_str("").unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.wait_exit_secs, 10);
    }

    #[test]
    fn supervisor_key_names() {
        let config: ServiceConfig = toml::from_str(
            r#"
            master_log = "/var/log/worker.log"
            master_args = "-u"
            fiber_owner = "nobody"
            fiber_queue_dir = "/var/spool/worker"
            wait_exit_secs = -1
            "#,
        )
        .unwrap();

        assert_eq!(config.log_path, Some(PathBuf::from("/var/log/worker.log")));
        assert_eq!(config.master_args, "-u");
        assert_eq!(config.owner, "nobody");
        assert_eq!(config.queue_dir, "/var/spool/worker");
        assert_eq!(config.wait_exit_secs, -1);
    }
}
