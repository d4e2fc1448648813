//! Frame decoding: bytes → UTF-8 text → JSON → typed envelopes.

use relay_core::{ProcedureKind, RelayError};
use serde_json::Value;

use crate::types::{ClientRequest, RequestId, RequestParams};

/// Decode one physical frame into its constituent JSON values.
///
/// A frame is a single JSON value or an array of values (a batch). A frame
/// that fails to parse yields one [`RelayError::Parse`] and no values.
pub fn decode_text(text: &str) -> Result<Vec<Value>, RelayError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| RelayError::parse(format!("invalid JSON frame: {e}")))?;
    match value {
        Value::Array(items) => Ok(items),
        other => Ok(vec![other]),
    }
}

/// Decode a raw byte frame, validating UTF-8 first.
pub fn decode_frame(bytes: &[u8]) -> Result<Vec<Value>, RelayError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| RelayError::parse(format!("frame is not UTF-8: {e}")))?;
    decode_text(text)
}

/// Parse one decoded JSON value into a [`ClientRequest`].
///
/// Structural failures (missing or null id, unrecognized method, missing
/// params) are `BAD_REQUEST`, returned together with the envelope's id when
/// one could be extracted.
pub fn parse_request(value: &Value) -> Result<ClientRequest, (Option<RequestId>, RelayError)> {
    let obj = value
        .as_object()
        .ok_or_else(|| (None, RelayError::bad_request("envelope must be an object")))?;

    let id: RequestId = match obj.get("id") {
        None | Some(Value::Null) => {
            return Err((None, RelayError::bad_request("envelope is missing an id")));
        }
        Some(raw) => serde_json::from_value(raw.clone()).map_err(|_| {
            (
                None,
                RelayError::bad_request("id must be a string or integer"),
            )
        })?,
    };

    let method = obj.get("method").and_then(Value::as_str).ok_or_else(|| {
        (
            Some(id.clone()),
            RelayError::bad_request("envelope is missing a method"),
        )
    })?;

    let kind = match method {
        "stop" => return Ok(ClientRequest::Stop { id }),
        "query" => ProcedureKind::Query,
        "mutation" => ProcedureKind::Mutation,
        "subscription" => ProcedureKind::Subscription,
        other => {
            return Err((
                Some(id),
                RelayError::bad_request(format!("unrecognized method '{other}'")),
            ));
        }
    };

    let params: RequestParams = match obj.get("params") {
        Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| {
            (
                Some(id.clone()),
                RelayError::bad_request(format!("invalid params: {e}")),
            )
        })?,
        None => {
            return Err((
                Some(id),
                RelayError::bad_request("call envelope requires params"),
            ));
        }
    };

    Ok(ClientRequest::Call { id, kind, params })
}
