//! Error types for jamhub
//!
//! Provides a unified error type used across the orchestrator and the
//! session workers. Every variant belongs to one [`ErrorKind`], which is what
//! callers branch on when deciding whether to retry, report or clean up.

use std::path::PathBuf;

/// Broad category of a [`JamError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed identifier, field or pattern
    Validation,
    /// Session, account, node or sound absent
    NotFound,
    /// Operation conflicts with current state (limits, in-flight uploads)
    State,
    /// Socket closed or errored mid-operation
    Transport,
    /// Bounded retries exhausted
    Timeout,
    /// Configuration, persistence and everything else
    Internal,
}

/// Main error type for jamhub operations
#[derive(Debug, thiserror::Error)]
pub enum JamError {
    // === Validation Errors ===

    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    // === Not Found Errors ===

    #[error("Auth session not found")]
    AuthSessionNotFound,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Sound not found: {0}")]
    SoundNotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    // === State Errors ===

    #[error("Auth session expired")]
    AuthSessionExpired,

    #[error("Maximum depth of {max} exceeded")]
    DepthExceeded { max: usize },

    #[error("Maximum width of {max} exceeded")]
    WidthExceeded { max: usize },

    #[error("Upload already in progress for {0}")]
    UploadInProgress(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    // === Transport Errors ===

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    // === Timeout Errors ===

    #[error("Address discovery for {session_id} gave up after {attempts} attempts")]
    DiscoveryTimeout { session_id: String, attempts: u32 },

    #[error("Timed out after {millis}ms: {operation}")]
    Timeout { operation: String, millis: u64 },

    // === Configuration Errors ===

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // === Process Errors ===

    #[error("Failed to spawn worker: {0}")]
    ProcessSpawn(String),

    // === Persistence Errors ===

    #[error("Persistence error: {0}")]
    Persistence(String),

    // === Internal Errors ===

    #[error("Internal error: {0}")]
    Internal(String),
}

impl JamError {
    /// Create a validation error for a named field
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::AuthSessionNotFound
            | Self::SessionNotFound(_)
            | Self::AccountNotFound(_)
            | Self::NodeNotFound(_)
            | Self::SoundNotFound(_)
            | Self::FileNotFound(_) => ErrorKind::NotFound,
            Self::AuthSessionExpired
            | Self::DepthExceeded { .. }
            | Self::WidthExceeded { .. }
            | Self::UploadInProgress(_)
            | Self::PermissionDenied(_) => ErrorKind::State,
            Self::Io(_) | Self::Connection(_) | Self::ConnectionClosed | Self::Protocol(_) => {
                ErrorKind::Transport
            }
            Self::DiscoveryTimeout { .. } | Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Config(_)
            | Self::ConfigInvalid { .. }
            | Self::FileRead { .. }
            | Self::FileWrite { .. }
            | Self::ProcessSpawn(_)
            | Self::Persistence(_)
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout { .. })
    }
}

/// Result type alias using JamError
pub type Result<T> = std::result::Result<T, JamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = JamError::SessionNotFound("a1b2c3d4".into());
        assert_eq!(err.to_string(), "Session not found: a1b2c3d4");
    }

    #[test]
    fn test_validation_display() {
        let err = JamError::validation("fileId", "must match \\w+");
        assert_eq!(err.to_string(), "Invalid fileId: must match \\w+");
    }

    #[test]
    fn test_limit_display() {
        assert_eq!(
            JamError::WidthExceeded { max: 4 }.to_string(),
            "Maximum width of 4 exceeded"
        );
        assert_eq!(
            JamError::DepthExceeded { max: 4 }.to_string(),
            "Maximum depth of 4 exceeded"
        );
    }

    #[test]
    fn test_kinds() {
        assert_eq!(JamError::validation("x", "y").kind(), ErrorKind::Validation);
        assert_eq!(JamError::NodeNotFound("n".into()).kind(), ErrorKind::NotFound);
        assert_eq!(JamError::SoundNotFound("s".into()).kind(), ErrorKind::NotFound);
        assert_eq!(JamError::UploadInProgress("f".into()).kind(), ErrorKind::State);
        assert_eq!(JamError::DepthExceeded { max: 1 }.kind(), ErrorKind::State);
        assert_eq!(JamError::ConnectionClosed.kind(), ErrorKind::Transport);
        assert_eq!(
            JamError::DiscoveryTimeout {
                session_id: "s".into(),
                attempts: 10
            }
            .kind(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn test_retryable() {
        assert!(JamError::connection("refused").is_retryable());
        assert!(!JamError::SessionNotFound("x".into()).is_retryable());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err: JamError = io_err.into();
        assert!(matches!(err, JamError::Io(_)));
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
