//! Protocol error type

/// Errors raised while parsing or framing jamhub messages
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame has no correlation id separator")]
    MissingSeparator,

    #[error("Invalid JSON payload for correlation id {correlation_id}: {message}")]
    InvalidJson {
        correlation_id: String,
        message: String,
    },

    #[error("Unknown frame prefix: {0}")]
    UnknownPrefix(String),

    #[error("Unknown request: {0}")]
    UnknownRequest(String),

    #[error("Invalid request {request}: {message}")]
    InvalidRequest { request: String, message: String },

    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("Frame too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

impl ProtocolError {
    /// Correlation id recovered before the failure, if any
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::InvalidJson { correlation_id, .. } => Some(correlation_id),
            _ => None,
        }
    }
}
