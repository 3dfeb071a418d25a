//! JSON-RPC 2.0 envelope shared by both directions of a session.

use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(Number),
    String(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One message in either direction: request, notification, result or error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    /// Absent for notifications; serialized as `null` on errors for unidentifiable requests.
    #[serde(default)]
    pub id: Option<RequestId>,
}

impl JsonRpcMessage {
    #[must_use]
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: Some(method.into()),
            params,
            result: None,
            error: None,
            id: Some(id),
        }
    }

    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: None,
            ..Self::request(RequestId::Number(0.into()), method, params)
        }
    }

    #[must_use]
    pub fn response(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: None,
            params: None,
            result: Some(result),
            error: None,
            id,
        }
    }

    #[must_use]
    pub fn error_response(id: Option<RequestId>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: None,
            params: None,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }

    #[must_use]
    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }

    /// A reply sent by the client (to a server-initiated request).
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }
}

/// Parse one inbound message body.
///
/// # Errors
///
/// `BadMessage` with `PARSE_ERROR` for invalid JSON and `INVALID_REQUEST` for JSON that is not
/// a single JSON-RPC 2.0 envelope.
pub fn parse_message(body: &[u8]) -> Result<JsonRpcMessage, RelayError> {
    let value: Value = serde_json::from_slice(body).map_err(|e| RelayError::BadMessage {
        code: PARSE_ERROR,
        message: format!("Parse error: {e}"),
    })?;

    let invalid = |message: String| RelayError::BadMessage {
        code: INVALID_REQUEST,
        message,
    };

    if !value.is_object() {
        return Err(invalid(
            "Invalid Request: expected a single JSON-RPC object".to_string(),
        ));
    }
    let message: JsonRpcMessage =
        serde_json::from_value(value).map_err(|e| invalid(format!("Invalid Request: {e}")))?;

    if message.jsonrpc != JSONRPC_VERSION {
        return Err(invalid(format!(
            "Invalid Request: unsupported jsonrpc version '{}'",
            message.jsonrpc
        )));
    }
    if message.method.is_none() && !message.is_response() {
        return Err(invalid(
            "Invalid Request: message has neither method nor result".to_string(),
        ));
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_requests_notifications_and_responses() {
        let req = parse_message(br#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#).expect("request");
        assert_eq!(req.id, Some(RequestId::Number(7.into())));
        assert!(!req.is_notification());

        let note = parse_message(br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .expect("notification");
        assert!(note.is_notification());

        let resp = parse_message(br#"{"jsonrpc":"2.0","id":"a","result":{}}"#).expect("response");
        assert!(resp.is_response());
        assert_eq!(resp.id, Some(RequestId::String("a".to_string())));
    }

    #[test]
    fn rejects_bad_payloads_with_protocol_codes() {
        let code = |body: &[u8]| match parse_message(body) {
            Err(RelayError::BadMessage { code, .. }) => code,
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(code(b"{not json"), PARSE_ERROR);
        assert_eq!(code(b"[1,2]"), INVALID_REQUEST);
        assert_eq!(code(br#"{"jsonrpc":"1.0","method":"ping","id":1}"#), INVALID_REQUEST);
        assert_eq!(code(br#"{"jsonrpc":"2.0","id":1}"#), INVALID_REQUEST);
    }

    #[test]
    fn error_responses_serialize_null_id() {
        let msg = JsonRpcMessage::error_response(None, PARSE_ERROR, "Parse error");
        let wire = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(
            wire,
            json!({
                "jsonrpc": "2.0",
                "error": {"code": -32700, "message": "Parse error"},
                "id": null
            })
        );
    }
}
