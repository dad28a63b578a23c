//! jam-utils: Common utilities shared across jamhub crates
//!
//! This crate provides:
//! - Unified error types ([`JamError`], [`ErrorKind`], [`Result`])
//! - Logging infrastructure ([`init_logging_with_config`], [`LogConfig`])
//! - XDG-compliant path utilities ([`paths`] module)
//! - Short random ids ([`short_id`])

pub mod error;
pub mod ids;
pub mod logging;
pub mod paths;

pub use error::{ErrorKind, JamError, Result};
pub use ids::short_id;
pub use logging::{init_logging_with_config, LogConfig, LogOutput};

pub use paths::{config_dir, config_file, data_dir, log_dir, state_dir, store_file, worker_data_dir};
