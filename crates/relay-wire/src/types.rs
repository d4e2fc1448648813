//! Envelope types exchanged over the duplex transport.

use relay_core::{ProcedureKind, RelayError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Out-of-band notification method asking clients to reconnect.
pub const METHOD_RECONNECT: &str = "reconnect";

/// Client-chosen request identifier: a JSON string or integer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id.
    Number(i64),
    /// String id.
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

/// Parameters of a procedure call envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestParams {
    /// Procedure path resolved by the dispatch engine.
    pub path: String,
    /// Optional input value, handed to the engine untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// A decoded incoming envelope.
///
/// Raw frames are decoded into this union once at the boundary
/// ([`crate::codec::parse_request`]); the multiplexer never touches raw JSON.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientRequest {
    /// `{id, method:"stop"}` — cancel the subscription registered under `id`.
    Stop {
        /// Id of the subscription to cancel.
        id: RequestId,
    },
    /// `{id, method, params:{path, input?}}` — execute a procedure.
    Call {
        /// Client-chosen id the response will echo.
        id: RequestId,
        /// Procedure kind named by the envelope's `method`.
        kind: ProcedureKind,
        /// Path and input.
        params: RequestParams,
    },
}

impl ClientRequest {
    /// The envelope's request id.
    pub fn id(&self) -> &RequestId {
        match self {
            Self::Stop { id } | Self::Call { id, .. } => id,
        }
    }
}

/// Structured error carried in an error envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code (e.g. `BAD_REQUEST`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&RelayError> for ErrorBody {
    fn from(err: &RelayError) -> Self {
        Self {
            code: err.code().to_owned(),
            message: err.to_string(),
            data: err.data().cloned(),
        }
    }
}

/// Result payload variants of a response envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResultPayload {
    /// One emitted value (single result or stream item).
    Data {
        /// The value.
        data: Value,
    },
    /// Subscription accepted and registered.
    Started,
    /// Subscription ended without error.
    Stopped,
}

/// `result` vs. `error` half of a response envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseBody {
    /// Successful result.
    Result {
        /// The result payload.
        result: ResultPayload,
    },
    /// Typed failure.
    Error {
        /// The error payload.
        error: ErrorBody,
    },
}

fn jsonrpc_version() -> String {
    "2.0".to_owned()
}

/// Outgoing response envelope.
///
/// `id` is `None` only for connection-scoped failures (e.g. a frame that
/// failed to parse); responses to well-formed requests always echo the
/// client's id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Echoed request id, or null for connection-scoped failures.
    pub id: Option<RequestId>,
    /// Protocol version marker.
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    /// Result or error.
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl ResponseEnvelope {
    /// A `data` result for `id`.
    pub fn data(id: RequestId, data: Value) -> Self {
        Self {
            id: Some(id),
            jsonrpc: jsonrpc_version(),
            body: ResponseBody::Result {
                result: ResultPayload::Data { data },
            },
        }
    }

    /// A `started` result for `id`.
    pub fn started(id: RequestId) -> Self {
        Self {
            id: Some(id),
            jsonrpc: jsonrpc_version(),
            body: ResponseBody::Result {
                result: ResultPayload::Started,
            },
        }
    }

    /// A `stopped` result for `id`.
    pub fn stopped(id: RequestId) -> Self {
        Self {
            id: Some(id),
            jsonrpc: jsonrpc_version(),
            body: ResponseBody::Result {
                result: ResultPayload::Stopped,
            },
        }
    }

    /// An error envelope for `id` (null id for connection-scoped failures).
    pub fn error(id: Option<RequestId>, err: &RelayError) -> Self {
        Self {
            id,
            jsonrpc: jsonrpc_version(),
            body: ResponseBody::Error {
                error: ErrorBody::from(err),
            },
        }
    }

    /// Serialize to the wire text form.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to serialize response envelope");
            String::new()
        })
    }
}

/// Out-of-band server-to-client notification (`{id:null, method}`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    /// Always null.
    pub id: Option<RequestId>,
    /// Notification method name.
    pub method: String,
}

impl NotificationEnvelope {
    /// The `reconnect` notification broadcast before a restart.
    pub fn reconnect() -> Self {
        Self {
            id: None,
            method: METHOD_RECONNECT.to_owned(),
        }
    }

    /// Serialize to the wire text form.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to serialize notification");
            String::new()
        })
    }
}
