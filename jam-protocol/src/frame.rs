//! Correlated JSON frames: `<correlationId>:<jsonPayload>`

use std::fmt;

use serde_json::Value;

use crate::ProtocolError;

/// Identifier pairing a request with its eventual response on one socket
///
/// Everything up to the first `:` of a frame. `-1` marks an unsolicited,
/// server-initiated message that answers no request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Wire value of an unsolicited message
    pub const UNSOLICITED: &'static str = "-1";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The `-1` correlation id
    pub fn unsolicited() -> Self {
        Self(Self::UNSOLICITED.to_string())
    }

    pub fn is_unsolicited(&self) -> bool {
        self.0 == Self::UNSOLICITED
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for CorrelationId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

/// One `<correlationId>:<json>` frame
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatedFrame {
    pub correlation_id: CorrelationId,
    pub payload: Value,
}

impl CorrelatedFrame {
    pub fn new(correlation_id: CorrelationId, payload: Value) -> Self {
        Self {
            correlation_id,
            payload,
        }
    }

    /// Frame carrying no matching request
    pub fn unsolicited(payload: Value) -> Self {
        Self::new(CorrelationId::unsolicited(), payload)
    }

    /// Parse a frame
    ///
    /// A frame without `:` yields [`ProtocolError::MissingSeparator`]; callers
    /// answer those under the unsolicited id. A payload that is not JSON
    /// yields [`ProtocolError::InvalidJson`] carrying the recovered id.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let (id, json) = raw.split_once(':').ok_or(ProtocolError::MissingSeparator)?;
        let payload =
            serde_json::from_str(json.trim_end()).map_err(|e| ProtocolError::InvalidJson {
                correlation_id: id.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self::new(CorrelationId::new(id), payload))
    }

    /// Serialize as `<id>:<json>`, without a frame terminator
    pub fn encode(&self) -> String {
        format!("{}:{}", self.correlation_id, self.payload)
    }
}

impl fmt::Display for CorrelatedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
