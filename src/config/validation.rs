//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate paths and addresses before they reach the lifecycle
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServiceConfig → Result<(), Vec<ValidationError>>

use std::net::SocketAddr;
use std::path::Path;

use crate::config::schema::ServiceConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("fiber_queue_dir must be an absolute path, got {0:?}")]
    RelativeRootDir(String),
    #[error("listen address {0:?} is not host:port")]
    InvalidListenAddress(String),
    #[error("metrics_address {0:?} is not a socket address")]
    InvalidMetricsAddress(String),
    #[error("standalone mode needs at least one listen address")]
    NoListenAddress,
}

pub fn validate_config(config: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if !config.queue_dir.is_empty() && !Path::new(&config.queue_dir).is_absolute() {
        errors.push(ValidationError::RelativeRootDir(config.queue_dir.clone()));
    }

    for address in &config.listen {
        if !is_host_port(address) {
            errors.push(ValidationError::InvalidListenAddress(address.clone()));
        }
    }

    if let Some(address) = &config.metrics_address {
        if address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidMetricsAddress(address.clone()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn is_host_port(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}
