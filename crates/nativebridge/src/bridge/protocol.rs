//! Wire protocol types for bridge envelopes.
//!
//! Every message is one JSON object:
//! - **Request**: `{"id", "type": <operation>, "args": [...]}`
//! - **Response**: `{"id", "type": "response", "value": ...}`
//! - **ErrorResponse**: `{"id", "type": "requestError", "error": {name, message, stack}}`
//!
//! The `type` member doubles as the operation name for requests, so the two
//! terminal type names can never be used as operation names.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

pub const RESPONSE_TYPE: &str = "response";
pub const ERROR_RESPONSE_TYPE: &str = "requestError";

/// Returns true for `type` values that mark a terminal envelope.
pub fn is_terminal_type(name: &str) -> bool {
    name == RESPONSE_TYPE || name == ERROR_RESPONSE_TYPE
}

/// Correlation identifier linking a request to its terminal reply.
///
/// Assigned by whichever side originates the request. Both sides originate
/// requests over the same channel, so generators prefix their ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CallId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Request,
    Response,
    ErrorResponse,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::ErrorResponse => "error-response",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Response | Self::ErrorResponse)
    }
}

/// Structured failure carried by an error-response.
///
/// `stack` is diagnostic text for humans; peers never parse it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub message: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub stack: String,
}

impl ErrorInfo {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: String::new(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = stack.into();
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

// Peers built on JSON libraries that write `null` for missing exception messages.
fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// The unit exchanged across the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request {
        id: CallId,
        operation: String,
        args: Vec<Value>,
    },
    Response {
        id: CallId,
        value: Value,
    },
    ErrorResponse {
        id: CallId,
        error: ErrorInfo,
    },
}

impl Envelope {
    pub fn request(id: CallId, operation: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Request {
            id,
            operation: operation.into(),
            args,
        }
    }

    pub fn response(id: CallId, value: Value) -> Self {
        Self::Response { id, value }
    }

    pub fn error_response(id: CallId, error: ErrorInfo) -> Self {
        Self::ErrorResponse { id, error }
    }

    pub fn id(&self) -> &CallId {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } | Self::ErrorResponse { id, .. } => {
                id
            }
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::Request { .. } => EnvelopeKind::Request,
            Self::Response { .. } => EnvelopeKind::Response,
            Self::ErrorResponse { .. } => EnvelopeKind::ErrorResponse,
        }
    }

    /// The `type` member as it appears on the wire.
    pub fn wire_type(&self) -> &str {
        match self {
            Self::Request { operation, .. } => operation,
            Self::Response { .. } => RESPONSE_TYPE,
            Self::ErrorResponse { .. } => ERROR_RESPONSE_TYPE,
        }
    }
}

/// Flat wire shape shared by all three envelope kinds.
#[derive(Debug, Deserialize)]
pub(crate) struct WireEnvelope {
    id: CallId,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    args: Option<Vec<Value>>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    error: Option<ErrorInfo>,
}

#[derive(Serialize)]
struct WireEnvelopeRef<'a> {
    id: &'a CallId,
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<&'a [Value]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ErrorInfo>,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = &'static str;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        match wire.kind.as_str() {
            "" => Err("empty type"),
            // A null value is omitted by some JSON writers; treat absence as null.
            RESPONSE_TYPE => Ok(Self::Response {
                id: wire.id,
                value: wire.value.unwrap_or(Value::Null),
            }),
            ERROR_RESPONSE_TYPE => match wire.error {
                Some(error) => Ok(Self::ErrorResponse { id: wire.id, error }),
                None => Err("requestError without error"),
            },
            _ => match wire.args {
                Some(args) => Ok(Self::Request {
                    id: wire.id,
                    operation: wire.kind,
                    args,
                }),
                None => Err("request without args"),
            },
        }
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match self {
            Self::Request {
                id,
                operation,
                args,
            } => WireEnvelopeRef {
                id,
                kind: operation,
                args: Some(args),
                value: None,
                error: None,
            },
            Self::Response { id, value } => WireEnvelopeRef {
                id,
                kind: RESPONSE_TYPE,
                args: None,
                value: Some(value),
                error: None,
            },
            Self::ErrorResponse { id, error } => WireEnvelopeRef {
                id,
                kind: ERROR_RESPONSE_TYPE,
                args: None,
                value: None,
                error: Some(error),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireEnvelope::deserialize(deserializer)?;
        Envelope::try_from(wire).map_err(serde::de::Error::custom)
    }
}
