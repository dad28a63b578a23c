//! Configuration loader

use std::net::SocketAddr;
use std::path::Path;

use jam_utils::{config_file, JamError, Result};

use super::AppConfig;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from default location
    pub fn load() -> Result<AppConfig> {
        let path = config_file();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            Ok(AppConfig::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<AppConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| JamError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&content, path)
    }

    /// Parse configuration from string
    pub fn parse(content: &str, path: &Path) -> Result<AppConfig> {
        toml::from_str(content).map_err(|e| JamError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Validate configuration
    pub fn validate(config: &AppConfig) -> Result<()> {
        for (name, addr) in [
            ("client_addr", &config.server.client_addr),
            ("control_addr", &config.server.control_addr),
        ] {
            if addr.parse::<SocketAddr>().is_err() {
                return Err(JamError::config(format!("{} is not a socket address: {}", name, addr)));
            }
        }

        if config.auth.token_ttl_secs == 0 {
            return Err(JamError::config("token_ttl_secs must be positive"));
        }
        if config.auth.prune_interval_secs == 0 || config.auth.prune_phase_secs == 0 {
            return Err(JamError::config("prune intervals must be positive"));
        }

        let workers = &config.workers;
        if workers.discovery_attempts == 0 {
            return Err(JamError::config("discovery_attempts must be at least 1"));
        }
        if workers.max_depth == 0 || workers.max_width == 0 {
            return Err(JamError::config("max_depth and max_width must be at least 1"));
        }
        if workers.default_length_secs == 0 || workers.default_length_secs > workers.max_length_secs {
            return Err(JamError::config(
                "default_length_secs must be between 1 and max_length_secs",
            ));
        }

        Ok(())
    }

    /// Load and validate
    pub fn load_and_validate(path: Option<&Path>) -> Result<AppConfig> {
        let config = match path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::load()?,
        };
        Self::validate(&config)?;
        Ok(config)
    }
}
