//! Wire protocol between the bridge and its worker subprocesses.
//!
//! Every frame is one JSON object on a single line, terminated by `\n`, on the
//! worker's stdin (requests) or stdout (responses).
//!
//! ```text
//! -> {"request_id":"<uuid>","action":"device.list","data":{}}
//! <- {"request_id":"<uuid>","success":true,"data":[...],"error_code":null,"error_message":null}
//! ```
//!
//! The codec only knows the envelope. Action names and payload shapes are
//! opaque to it.

use super::types::WorkerType;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// No-op action every worker must answer, used by the health watchdog
pub const PING_ACTION: &str = "ping";

/// Code used when a worker reports failure without an `error_code`
pub const UNKNOWN_ERROR_CODE: &str = "UNKNOWN_ERROR";

/// Correlation id tying a response to the request that caused it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outbound call to a worker
#[derive(Debug, Clone)]
pub struct Request {
    pub request_id: RequestId,
    pub worker_type: WorkerType,
    /// Fully qualified action, e.g. `memory.allocate`
    pub action: String,
    pub payload: Value,
}

#[derive(Serialize)]
struct RequestFrame<'a> {
    request_id: &'a str,
    action: &'a str,
    data: &'a Value,
}

impl Request {
    /// Serialize to a newline-terminated frame
    pub fn to_frame(&self) -> Result<Vec<u8>, ProtocolError> {
        let frame = RequestFrame {
            request_id: self.request_id.as_str(),
            action: &self.action,
            data: &self.payload,
        };
        let mut bytes =
            serde_json::to_vec(&frame).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// Decoded result carried by a response
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failure { code: String, message: String },
}

/// Inbound answer from a worker
#[derive(Debug, Clone)]
pub struct Response {
    pub request_id: RequestId,
    pub outcome: Outcome,
    pub received_at: DateTime<Utc>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }
}

/// Envelope-level decoding failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },

    #[error("response id '{actual}' does not match request '{expected}'")]
    CorrelationMismatch { expected: String, actual: String },

    #[error("request could not be encoded: {0}")]
    Encode(String),
}

/// Stateless request builder and response parser
pub struct Codec;

impl Codec {
    /// Build a request with a fresh correlation id
    pub fn encode(worker_type: WorkerType, action: &str, payload: Value) -> Request {
        Request {
            request_id: RequestId::generate(),
            worker_type,
            action: Self::qualify_action(worker_type, action),
            payload,
        }
    }

    /// Liveness probe for a worker type
    pub fn ping(worker_type: WorkerType) -> Request {
        Self::encode(worker_type, PING_ACTION, Value::Object(Default::default()))
    }

    /// Prefix `action` with the worker's domain unless already prefixed
    pub fn qualify_action(worker_type: WorkerType, action: &str) -> String {
        let prefix = worker_type.as_str();
        match action.strip_prefix(prefix) {
            Some(rest) if rest.starts_with('.') => action.to_string(),
            _ => format!("{}.{}", prefix, action),
        }
    }

    /// Classify a stdout line: a JSON object is a protocol frame, anything
    /// else (including brace-wrapped text that is not JSON) is a diagnostic.
    pub fn parse_frame(line: &str) -> Option<Map<String, Value>> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        match serde_json::from_str(trimmed) {
            Ok(Value::Object(obj)) => Some(obj),
            _ => None,
        }
    }

    /// Parse and validate a response frame
    pub fn decode(raw: &[u8]) -> Result<Response, ProtocolError> {
        let value: Value =
            serde_json::from_slice(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let obj = value.as_object().ok_or(ProtocolError::NotAnObject)?;
        Self::decode_frame(obj)
    }

    /// Validate the envelope of an already parsed frame
    pub fn decode_frame(obj: &Map<String, Value>) -> Result<Response, ProtocolError> {
        let request_id = match obj.get("request_id") {
            None | Some(Value::Null) => return Err(ProtocolError::MissingField("request_id")),
            Some(Value::String(s)) if !s.is_empty() => RequestId(s.clone()),
            Some(_) => {
                return Err(ProtocolError::InvalidField {
                    field: "request_id",
                    expected: "a non-empty string",
                })
            }
        };

        let success = match obj.get("success") {
            None | Some(Value::Null) => return Err(ProtocolError::MissingField("success")),
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                return Err(ProtocolError::InvalidField {
                    field: "success",
                    expected: "a boolean",
                })
            }
        };

        let outcome = if success {
            Outcome::Success(obj.get("data").cloned().unwrap_or(Value::Null))
        } else {
            let code = obj
                .get("error_code")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .unwrap_or(UNKNOWN_ERROR_CODE)
                .to_string();
            let message = obj
                .get("error_message")
                .and_then(Value::as_str)
                .unwrap_or("worker reported failure without a message")
                .to_string();
            Outcome::Failure { code, message }
        };

        Ok(Response {
            request_id,
            outcome,
            received_at: Utc::now(),
        })
    }

    /// Best-effort extraction of `request_id` from a frame that failed to decode,
    /// so the failure can be routed to the call it belongs to.
    pub fn peek_request_id(obj: &Map<String, Value>) -> Option<RequestId> {
        obj.get("request_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(RequestId::from)
    }
}
