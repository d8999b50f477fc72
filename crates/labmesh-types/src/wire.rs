//! Wire envelopes for the request/reply and publish channels.
//!
//! Both channels carry one JSON document per line.  The shapes are:
//!
//! | Envelope | JSON |
//! |---|---|
//! | [`Request`] | `{"type": "rpc"\|"quit", "id": uuid?, "method_name": str, "args": [..], "kwargs": {..}}` |
//! | [`Response`] | `{"error": "none"\|"invalid_request"\|"wrong_method"\|"internal_error", "result": any, "id": uuid?}` |
//! | [`Envelope`] | `{"topic": 1\|2\|3, "contents": any}` |

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::LabError;

// ─────────────────────────────────────────────────────────────────────────────
// Request
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Rpc,
    Quit,
}

/// A single remote call.  Sent exactly once; the caller blocks until the
/// matching [`Response`] arrives or its timeout elapses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: RequestKind,
    /// Correlation id echoed by the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub method_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Request {
    pub fn rpc(method_name: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            kind: RequestKind::Rpc,
            id: Some(Uuid::new_v4()),
            method_name: method_name.into(),
            args,
            kwargs,
        }
    }

    pub fn quit() -> Self {
        Self {
            kind: RequestKind::Quit,
            id: Some(Uuid::new_v4()),
            method_name: String::new(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn encode(&self) -> Result<String, LabError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode one line.  Any failure is an [`LabError::InvalidRequest`].
    pub fn decode(line: &str) -> Result<Self, LabError> {
        serde_json::from_str(line).map_err(|e| LabError::InvalidRequest(e.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Response
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome category of a [`Response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "invalid_request")]
    InvalidRequest,
    #[serde(rename = "wrong_method")]
    UnknownMethod,
    #[serde(rename = "internal_error")]
    InternalError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::None => "none",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::UnknownMethod => "wrong_method",
            ErrorKind::InternalError => "internal_error",
        };
        f.write_str(name)
    }
}

/// Reply to a [`Request`].  `result` is only meaningful when `error` is
/// [`ErrorKind::None`]; otherwise it carries a human-readable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub error: ErrorKind,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
}

impl Response {
    pub fn ok(id: Option<Uuid>, result: Value) -> Self {
        Self {
            error: ErrorKind::None,
            result,
            id,
        }
    }

    pub fn error(id: Option<Uuid>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: kind,
            result: Value::String(message.into()),
            id,
        }
    }

    pub fn encode(&self) -> Result<String, LabError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(line: &str) -> Result<Self, LabError> {
        Ok(serde_json::from_str(line)?)
    }

    /// Turn the response into the caller-facing outcome of `method`.
    pub fn into_result(self, method: &str) -> Result<Value, LabError> {
        match self.error {
            ErrorKind::None => Ok(self.result),
            kind => Err(LabError::Remote {
                method: method.to_string(),
                kind,
                message: match self.result {
                    Value::String(s) => s,
                    other => other.to_string(),
                },
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Publish envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Telemetry category used for subscriber-side filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Topic {
    /// The worker's status snapshot.
    Status,
    /// Output lines captured since the previous refresh tick.
    Stdout,
    /// Error lines captured since the previous refresh tick.
    Stderr,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::Status, Topic::Stdout, Topic::Stderr];
}

impl From<Topic> for u8 {
    fn from(topic: Topic) -> u8 {
        match topic {
            Topic::Status => 1,
            Topic::Stdout => 2,
            Topic::Stderr => 3,
        }
    }
}

impl TryFrom<u8> for Topic {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Topic::Status),
            2 => Ok(Topic::Stdout),
            3 => Ok(Topic::Stderr),
            other => Err(format!("unknown topic {other}")),
        }
    }
}

/// One message on a worker's publish channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: Topic,
    pub contents: Value,
}

impl Envelope {
    pub fn new(topic: Topic, contents: Value) -> Self {
        Self { topic, contents }
    }

    pub fn encode(&self) -> Result<String, LabError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(line: &str) -> Result<Self, LabError> {
        Ok(serde_json::from_str(line)?)
    }
}
