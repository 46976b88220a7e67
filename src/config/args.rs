//! Command-line arguments passed by the supervisor.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "master-service")]
#[command(about = "Worker process run under a supervising master", long_about = None)]
pub struct ServiceArgs {
    /// Service configuration file
    #[arg(short = 'f', value_name = "CONF")]
    pub config_path: Option<PathBuf>,

    /// Service name
    #[arg(short = 'n', default_value = "")]
    pub service_name: String,

    /// Service type
    #[arg(short = 't', default_value = "sock")]
    pub service_type: String,

    /// Number of inherited listener descriptors
    #[arg(short = 's', default_value_t = 1, allow_negative_numbers = true)]
    pub listen_fd_count: i64,

    /// Drop to the configured user after startup
    #[arg(short = 'u')]
    pub unprivileged: bool,

    /// Verbose logging
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Confine to the configured queue directory
    #[arg(short = 'c')]
    pub chroot: bool,

    /// Run without a supervisor
    #[arg(long)]
    pub alone: bool,

    /// Address to bind when running alone (repeatable)
    #[arg(short = 'l', long = "listen", value_name = "HOST:PORT")]
    pub listen: Vec<String>,
}

impl ServiceArgs {
    /// Inherited descriptor count; anything below 1 means 1.
    pub fn socket_count(&self) -> usize {
        usize::try_from(self.listen_fd_count)
            .ok()
            .filter(|count| *count > 0)
            .unwrap_or(1)
    }
}
