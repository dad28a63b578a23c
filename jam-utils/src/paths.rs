//! Path utilities for jamhub
//!
//! XDG locations for the config file, logs, the session store and
//! per-session sound files.

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Application identifier for XDG directories
const APP_NAME: &str = "jamhub";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

/// Get the configuration directory
///
/// Location: `$XDG_CONFIG_HOME/jamhub` or `~/.config/jamhub`
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(fallback_config_dir)
}

/// Get the main configuration file path
///
/// Location: `$XDG_CONFIG_HOME/jamhub/config.toml`
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Get the state directory
///
/// Location: `$XDG_STATE_HOME/jamhub` or `~/.local/state/jamhub`
pub fn state_dir() -> PathBuf {
    project_dirs()
        .and_then(|p| p.state_dir().map(|d| d.to_path_buf()))
        .unwrap_or_else(fallback_state_dir)
}

/// Get the data directory
///
/// Location: `$XDG_DATA_HOME/jamhub` or `~/.local/share/jamhub`
pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.data_local_dir().to_path_buf())
        .unwrap_or_else(fallback_data_dir)
}

/// Get the log directory
///
/// Location: `$XDG_STATE_HOME/jamhub/log`
pub fn log_dir() -> PathBuf {
    state_dir().join("log")
}

/// Get the session record store file
///
/// Location: `$XDG_DATA_HOME/jamhub/store.json`
pub fn store_file() -> PathBuf {
    data_dir().join("store.json")
}

/// Get a worker's data directory (uploaded sound files live here)
///
/// Location: `$XDG_DATA_HOME/jamhub/sessions/{session_id}`
pub fn worker_data_dir(session_id: &str) -> PathBuf {
    data_dir().join("sessions").join(session_id)
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
        tracing::debug!("Created directory {}", path.display());
    }
    Ok(())
}

// Fallback implementations when ProjectDirs is unavailable

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

fn fallback_config_dir() -> PathBuf {
    home_dir().join(".config").join(APP_NAME)
}

fn fallback_state_dir() -> PathBuf {
    home_dir().join(".local").join("state").join(APP_NAME)
}

fn fallback_data_dir() -> PathBuf {
    home_dir().join(".local").join("share").join(APP_NAME)
}
