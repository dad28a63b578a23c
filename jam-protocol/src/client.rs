//! Browser link frames
//!
//! Client to server:
//! - `tok:<token>` binds the link to an auth session
//! - `jam:<correlationId>:<json>` carries `{token, sessionId, req}`
//! - `ses:<correlationId>:<json>` logs in, issues an anonymous token or logs off
//!
//! Server to client:
//! - `ses:<correlationId>:<json>` auth lifecycle notices and login replies
//! - `jam:<correlationId>:<json>` session responses

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{CorrelatedFrame, CorrelationId, ProtocolError};

const TOKEN_PREFIX: &str = "tok:";
const JAM_PREFIX: &str = "jam:";
const SESSION_PREFIX: &str = "ses:";

/// Body of a `jam:` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JamRequest {
    pub token: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub req: Value,
}

/// Body of a `ses:` request
#[derive(Debug, Clone, PartialEq)]
pub enum SessionRequest {
    /// `{"login":{"accountId":"..."}}`
    Login { account_id: String },
    /// `{"anonymous":true}`
    Anonymous,
    /// `{"logout":"<token>"}`
    Logout { token: String },
}

impl SessionRequest {
    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        if let Some(login) = value.get("login") {
            let account_id = login
                .get("accountId")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ProtocolError::InvalidRequest {
                    request: "login".into(),
                    message: "accountId required".into(),
                })?;
            return Ok(Self::Login {
                account_id: account_id.to_string(),
            });
        }
        if value.get("anonymous").and_then(Value::as_bool) == Some(true) {
            return Ok(Self::Anonymous);
        }
        if let Some(token) = value.get("logout").and_then(Value::as_str) {
            return Ok(Self::Logout {
                token: token.to_string(),
            });
        }
        Err(ProtocolError::UnknownRequest(value.to_string()))
    }
}

/// A frame received from a browser link
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Token(String),
    Jam {
        correlation_id: CorrelationId,
        request: JamRequest,
    },
    Session {
        correlation_id: CorrelationId,
        request: SessionRequest,
    },
}

impl ClientFrame {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        if let Some(token) = raw.strip_prefix(TOKEN_PREFIX) {
            return Ok(Self::Token(token.trim().to_string()));
        }

        if let Some(rest) = raw.strip_prefix(JAM_PREFIX) {
            let frame = CorrelatedFrame::parse(rest)?;
            let request: JamRequest =
                serde_json::from_value(frame.payload).map_err(|e| ProtocolError::InvalidJson {
                    correlation_id: frame.correlation_id.to_string(),
                    message: e.to_string(),
                })?;
            return Ok(Self::Jam {
                correlation_id: frame.correlation_id,
                request,
            });
        }

        if let Some(rest) = raw.strip_prefix(SESSION_PREFIX) {
            let frame = CorrelatedFrame::parse(rest)?;
            let request = SessionRequest::from_value(&frame.payload)?;
            return Ok(Self::Session {
                correlation_id: frame.correlation_id,
                request,
            });
        }

        let prefix: String = raw.chars().take(4).collect();
        Err(ProtocolError::UnknownPrefix(prefix))
    }
}

/// Auth lifecycle notices pushed to a bound link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionNotice {
    Expired,
    Ping,
    LoggedOff,
}

impl SessionNotice {
    pub fn to_value(self) -> Value {
        match self {
            Self::Expired => json!({ "expired": true }),
            Self::Ping => json!({ "ping": true }),
            Self::LoggedOff => json!({ "loggedOff": true }),
        }
    }
}

/// A frame sent to a browser link
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Session(CorrelatedFrame),
    Jam(CorrelatedFrame),
}

impl ServerFrame {
    /// Unsolicited `ses:-1:` notice
    pub fn notice(notice: SessionNotice) -> Self {
        Self::Session(CorrelatedFrame::unsolicited(notice.to_value()))
    }

    pub fn session(correlation_id: CorrelationId, payload: Value) -> Self {
        Self::Session(CorrelatedFrame::new(correlation_id, payload))
    }

    /// `jam:` response carrying a worker `res` object for one session
    pub fn jam_response(correlation_id: CorrelationId, session_id: &str, res: Value) -> Self {
        Self::Jam(CorrelatedFrame::new(
            correlation_id,
            json!({ "sessionId": session_id, "res": res }),
        ))
    }

    /// `jam:` error for one session (or none, when the request named no session)
    pub fn jam_error(
        correlation_id: CorrelationId,
        session_id: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self::Jam(CorrelatedFrame::new(
            correlation_id,
            json!({ "sessionId": session_id, "error": message.into() }),
        ))
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Session(frame) => format!("{}{}", SESSION_PREFIX, frame.encode()),
            Self::Jam(frame) => format!("{}{}", JAM_PREFIX, frame.encode()),
        }
    }
}
