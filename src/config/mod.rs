//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! argv (supervisor flags)
//!     → args.rs (clap)
//! config file (TOML, -f)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServiceConfig (validated, immutable)
//!     → lifecycle::startup derives identity, listener mode, drain deadline
//! ```
//!
//! # Design Decisions
//! - Config is read once at startup and never reloaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod args;
pub mod loader;
pub mod schema;
pub mod validation;

pub use args::ServiceArgs;
pub use loader::{load_config, ConfigError};
pub use schema::ServiceConfig;
pub use validation::{validate_config, ValidationError};
