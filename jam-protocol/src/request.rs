//! Control-socket vocabulary between orchestrator and session worker
//!
//! Requests are either bare strings (`"info"`, `"nodes"`, `"sounds"`,
//! `"chain"`) or single-key objects such as `{"addNode": null}` and
//! `{"assignSound": "s1", "toNode": "n1"}`. Every reply carries the worker's
//! `connectedAccounts`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::ProtocolError;

/// Fields accepted by `upsertSound`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoundParams {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gain: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pan: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stops: Option<[u64; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

/// Fields accepted by the orchestrator-level `createSession` request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionParams {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub length_secs: Option<u64>,
}

impl CreateSessionParams {
    /// Extract `{"createSession": {...}}`, if that is what `req` is
    pub fn from_request(req: &Value) -> Option<Result<Self, ProtocolError>> {
        let body = req.get("createSession")?;
        Some(
            serde_json::from_value(body.clone()).map_err(|e| ProtocolError::InvalidRequest {
                request: "createSession".into(),
                message: e.to_string(),
            }),
        )
    }
}

/// A request understood by a session worker
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerRequest {
    Info,
    Nodes,
    Sounds,
    Chain,
    AddAccount(String),
    DeleteAccount(String),
    EndSession,
    /// `None` attaches to the root
    AddNode { parent: Option<String> },
    DeleteNode(String),
    SelectNode(String),
    AssignSound { sound: String, to_node: String },
    UpsertSound(SoundParams),
    DeleteSound(String),
}

impl WorkerRequest {
    /// Short name used in logs and error messages
    pub fn name(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Nodes => "nodes",
            Self::Sounds => "sounds",
            Self::Chain => "chain",
            Self::AddAccount(_) => "addAccount",
            Self::DeleteAccount(_) => "deleteAccount",
            Self::EndSession => "endSession",
            Self::AddNode { .. } => "addNode",
            Self::DeleteNode(_) => "deleteNode",
            Self::SelectNode(_) => "selectNode",
            Self::AssignSound { .. } => "assignSound",
            Self::UpsertSound(_) => "upsertSound",
            Self::DeleteSound(_) => "deleteSound",
        }
    }

    /// Whether the request changes worker state
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::Info | Self::Nodes | Self::Sounds | Self::Chain)
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        match value {
            Value::String(name) => match name.as_str() {
                "info" => Ok(Self::Info),
                "nodes" => Ok(Self::Nodes),
                "sounds" => Ok(Self::Sounds),
                "chain" => Ok(Self::Chain),
                other => Err(ProtocolError::UnknownRequest(other.to_string())),
            },
            Value::Object(map) => Self::from_object(map),
            other => Err(ProtocolError::UnknownRequest(other.to_string())),
        }
    }

    fn from_object(map: &Map<String, Value>) -> Result<Self, ProtocolError> {
        if let Some(sound) = map.get("assignSound") {
            let sound = required_str("assignSound", sound)?;
            let to_node = map
                .get("toNode")
                .ok_or_else(|| invalid("assignSound", "toNode required"))
                .and_then(|v| required_str("assignSound", v))?;
            return Ok(Self::AssignSound { sound, to_node });
        }

        if let Some(params) = map.get("upsertSound") {
            let params: SoundParams = serde_json::from_value(params.clone())
                .map_err(|e| invalid("upsertSound", e.to_string()))?;
            return Ok(Self::UpsertSound(params));
        }

        if let Some(parent) = map.get("addNode") {
            return Ok(Self::AddNode {
                parent: truthy_str(parent),
            });
        }

        if map.contains_key("endSession") {
            return Ok(Self::EndSession);
        }

        let single = |key: &str, ctor: fn(String) -> Self| -> Option<Result<Self, ProtocolError>> {
            map.get(key).map(|v| required_str(key, v).map(ctor))
        };

        single("addAccount", Self::AddAccount)
            .or_else(|| single("deleteAccount", Self::DeleteAccount))
            .or_else(|| single("deleteNode", Self::DeleteNode))
            .or_else(|| single("selectNode", Self::SelectNode))
            .or_else(|| single("deleteSound", Self::DeleteSound))
            .unwrap_or_else(|| {
                let keys: Vec<&str> = map.keys().map(String::as_str).collect();
                Err(ProtocolError::UnknownRequest(keys.join(",")))
            })
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Info => json!("info"),
            Self::Nodes => json!("nodes"),
            Self::Sounds => json!("sounds"),
            Self::Chain => json!("chain"),
            Self::AddAccount(id) => json!({ "addAccount": id }),
            Self::DeleteAccount(id) => json!({ "deleteAccount": id }),
            Self::EndSession => json!({ "endSession": true }),
            Self::AddNode { parent } => json!({ "addNode": parent }),
            Self::DeleteNode(uid) => json!({ "deleteNode": uid }),
            Self::SelectNode(uid) => json!({ "selectNode": uid }),
            Self::AssignSound { sound, to_node } => {
                json!({ "assignSound": sound, "toNode": to_node })
            }
            Self::UpsertSound(params) => json!({ "upsertSound": params }),
            Self::DeleteSound(uid) => json!({ "deleteSound": uid }),
        }
    }
}

fn invalid(request: &str, message: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidRequest {
        request: request.to_string(),
        message: message.into(),
    }
}

fn required_str(request: &str, value: &Value) -> Result<String, ProtocolError> {
    value
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| invalid(request, "expected a non-empty string"))
}

/// `null`, `false`, `0` and `""` all mean "no value"
fn truthy_str(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// `{"res": {...res, "connectedAccounts": [...]}}`
pub fn reply(mut res: Map<String, Value>, connected_accounts: &[String]) -> Value {
    res.insert("connectedAccounts".into(), json!(connected_accounts));
    json!({ "res": res })
}

/// `{"error": message, "connectedAccounts": [...]}`
pub fn error_reply(message: impl Into<String>, connected_accounts: &[String]) -> Value {
    json!({ "error": message.into(), "connectedAccounts": connected_accounts })
}

/// `connectedAccounts` of a worker reply, wherever it sits
pub fn reply_connected_accounts(payload: &Value) -> Option<Vec<String>> {
    let accounts = payload
        .get("res")
        .and_then(|res| res.get("connectedAccounts"))
        .or_else(|| payload.get("connectedAccounts"))?
        .as_array()?;
    Some(
        accounts
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
    )
}
