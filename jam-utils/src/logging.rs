//! Logging infrastructure for jamhub
//!
//! Provides unified logging setup using the tracing ecosystem.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::{paths, JamError, Result};

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "JAM_LOG";

/// Log file used when a config names none
const DEFAULT_LOG_FILE: &str = "jamhub.log";

/// Log output destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    /// Log to stderr
    Stderr,
    /// Log to file
    File,
    /// Log to both stderr and file
    Both,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Output destination
    pub output: LogOutput,
    /// Log level filter (e.g., "info", "debug", "jam_server=debug,tokio=warn")
    pub filter: String,
    /// Include span events (enter/exit)
    pub span_events: bool,
    /// Include file/line in logs
    pub file_line: bool,
    /// Optional custom log file name (defaults to "jamhub.log")
    pub file_name: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            output: LogOutput::Stderr,
            filter: "info".into(),
            span_events: false,
            file_line: false,
            file_name: None,
        }
    }
}

impl LogConfig {
    /// Config for the orchestrator (stderr plus file)
    pub fn orchestrator() -> Self {
        Self {
            output: LogOutput::Both,
            filter: std::env::var(LOG_ENV).unwrap_or_else(|_| "info".into()),
            span_events: false,
            file_line: true,
            file_name: Some("jam-server.log".into()),
        }
    }

    /// Config for a session worker, one file per session
    pub fn worker(session_id: &str) -> Self {
        Self {
            output: LogOutput::File,
            filter: std::env::var(LOG_ENV).unwrap_or_else(|_| "info".into()),
            span_events: false,
            file_line: true,
            file_name: Some(format!("worker-{}.log", session_id)),
        }
    }

    /// Config for development (verbose stderr)
    pub fn development() -> Self {
        Self {
            output: LogOutput::Stderr,
            filter: "debug".into(),
            span_events: true,
            file_line: true,
            file_name: None,
        }
    }
}

/// Initialize logging with custom configuration
///
/// Stderr and file output are independent layers; either may be absent.
pub fn init_logging_with_config(config: LogConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.filter).map_err(|e| {
        JamError::config(format!("Invalid log filter {:?}: {}", config.filter, e))
    })?;
    let span_events = if config.span_events {
        FmtSpan::ENTER | FmtSpan::EXIT
    } else {
        FmtSpan::NONE
    };

    let to_stderr = matches!(config.output, LogOutput::Stderr | LogOutput::Both);
    let stderr_layer = to_stderr.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_span_events(span_events.clone())
            .with_file(config.file_line)
            .with_line_number(config.file_line)
    });

    let file_layer = match config.output {
        LogOutput::Stderr => None,
        LogOutput::File | LogOutput::Both => {
            let file = open_log_file(config.file_name.as_deref().unwrap_or(DEFAULT_LOG_FILE))?;
            Some(
                fmt::layer()
                    .with_writer(file)
                    .with_ansi(false)
                    .with_span_events(span_events)
                    .with_file(config.file_line)
                    .with_line_number(config.file_line),
            )
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| JamError::internal(format!("Logging already initialized: {}", e)))
}

fn open_log_file(file_name: &str) -> Result<std::fs::File> {
    let log_dir = paths::log_dir();
    std::fs::create_dir_all(&log_dir).map_err(|e| JamError::FileWrite {
        path: log_dir.clone(),
        source: e,
    })?;

    let log_path = log_dir.join(file_name);
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| JamError::FileWrite {
            path: log_path,
            source: e,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.output, LogOutput::Stderr);
        assert_eq!(config.filter, "info");
        assert!(config.file_name.is_none());
    }

    #[test]
    fn test_orchestrator_config() {
        let config = LogConfig::orchestrator();
        assert_eq!(config.output, LogOutput::Both);
        assert_eq!(config.file_name.as_deref(), Some("jam-server.log"));
    }

    #[test]
    fn test_worker_config_names_file_after_session() {
        let config = LogConfig::worker("a1b2c3d4");
        assert_eq!(config.output, LogOutput::File);
        assert_eq!(config.file_name.as_deref(), Some("worker-a1b2c3d4.log"));
    }

    #[test]
    fn test_invalid_filter_is_config_error() {
        let config = LogConfig {
            filter: "jam=notalevel".into(),
            ..LogConfig::default()
        };
        let result = init_logging_with_config(config);
        assert!(matches!(result, Err(JamError::Config(_))));
    }
}
