//! MCP method dispatch for one inbound message.

use crate::jsonrpc::{
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, JsonRpcMessage, METHOD_NOT_FOUND,
};
use mcp_relay_openapi_tools::error::OpenApiToolsError;
use mcp_relay_openapi_tools::proxy::ToolProxy;
use serde_json::{Value, json};

/// Protocol revision answered when the client does not state one.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Handle one message; `None` means nothing is sent back (notifications, client replies).
pub async fn dispatch(proxy: &ToolProxy, message: JsonRpcMessage) -> Option<JsonRpcMessage> {
    if message.is_response() {
        tracing::debug!(id = ?message.id, "ignoring client response");
        return None;
    }

    let Some(method) = message.method.as_deref() else {
        return Some(JsonRpcMessage::error_response(
            message.id,
            INVALID_REQUEST,
            "Invalid Request: missing method",
        ));
    };

    if message.is_notification() {
        tracing::debug!(method = %method, "received notification");
        return None;
    }

    let id = message.id.clone();
    let params = message.params.unwrap_or(Value::Null);

    let outcome = match method {
        "initialize" => Ok(initialize(&params)),
        "ping" => Ok(json!({})),
        "tools/list" | "list" => list_tools(proxy),
        "tools/call" | "call" => call_tool(proxy, &params).await,
        other => Err((METHOD_NOT_FOUND, format!("Method not found: {other}"))),
    };

    Some(match outcome {
        Ok(result) => JsonRpcMessage::response(id, result),
        Err((code, msg)) => JsonRpcMessage::error_response(id, code, msg),
    })
}

fn initialize(params: &Value) -> Value {
    let protocol_version = params
        .get("protocolVersion")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_PROTOCOL_VERSION);

    json!({
        "protocolVersion": protocol_version,
        "capabilities": {
            "tools": { "listChanged": false }
        },
        "serverInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

fn list_tools(proxy: &ToolProxy) -> Result<Value, (i64, String)> {
    let tools = serde_json::to_value(proxy.list_tools()).map_err(|e| internal(&e))?;
    Ok(json!({ "tools": tools }))
}

async fn call_tool(proxy: &ToolProxy, params: &Value) -> Result<Value, (i64, String)> {
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return Err((
            INVALID_PARAMS,
            "Invalid params: 'name' must be a string".to_string(),
        ));
    };
    let arguments = match params.get("arguments") {
        None | Some(Value::Null) => json!({}),
        Some(args @ Value::Object(_)) => args.clone(),
        Some(_) => {
            return Err((
                INVALID_PARAMS,
                "Invalid params: 'arguments' must be an object".to_string(),
            ));
        }
    };

    match proxy.call_tool(name, arguments).await {
        Ok(result) => serde_json::to_value(result).map_err(|e| internal(&e)),
        Err(e @ OpenApiToolsError::UnknownTool(_)) => Err((METHOD_NOT_FOUND, e.to_string())),
        Err(e @ OpenApiToolsError::InvalidArguments(_)) => Err((INVALID_PARAMS, e.to_string())),
        Err(e) => Err(internal(&e)),
    }
}

fn internal(error: &dyn std::fmt::Display) -> (i64, String) {
    tracing::error!(error = %error, "tool dispatch failed");
    (INTERNAL_ERROR, "Internal error".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::RequestId;
    use mcp_relay_openapi_tools::config::{ConnectionConfig, ConverterOptions, ExecutorSettings};
    use mcp_relay_openapi_tools::converter::{SpecConverter, parse_spec};
    use mcp_relay_openapi_tools::executor::RequestExecutor;
    use std::sync::Arc;

    const SPEC: &str = r#"
openapi: "3.0.0"
info: { title: Pages, version: "1" }
servers: [ { url: "https://api.example.com" } ]
paths:
  /pages/{id}:
    get:
      operationId: retrieve-a-page
      tags: [pages]
      parameters:
        - { name: id, in: path, required: true, schema: { type: string } }
      responses: { "200": { description: ok } }
"#;

    fn proxy() -> ToolProxy {
        let spec = parse_spec(SPEC, "inline").expect("parse");
        let converted = SpecConverter::new(ConverterOptions::default())
            .convert(&spec)
            .expect("convert");
        let connection =
            ConnectionConfig::new("http://127.0.0.1:9", "k", "v1").expect("connection");
        let executor =
            RequestExecutor::new(connection, ExecutorSettings::default()).expect("executor");
        ToolProxy::new(Arc::new(converted), executor)
    }

    fn request(method: &str, params: Value) -> JsonRpcMessage {
        JsonRpcMessage::request(RequestId::Number(1.into()), method, Some(params))
    }

    fn error_code(reply: Option<JsonRpcMessage>) -> i64 {
        reply.and_then(|m| m.error).map(|e| e.code).expect("error reply")
    }

    #[tokio::test]
    async fn initialize_echoes_protocol_version() {
        let reply = dispatch(
            &proxy(),
            request("initialize", json!({"protocolVersion": "2025-03-26"})),
        )
        .await
        .expect("reply");
        let result = reply.result.expect("result");
        assert_eq!(result["protocolVersion"], "2025-03-26");
        assert_eq!(result["serverInfo"]["name"], "mcp-relay");
        assert!(result["capabilities"]["tools"].is_object());
        assert_eq!(reply.id, Some(RequestId::Number(1.into())));
    }

    #[tokio::test]
    async fn tools_list_and_alias() {
        for method in ["tools/list", "list"] {
            let reply = dispatch(&proxy(), request(method, json!({})))
                .await
                .expect("reply");
            let tools = &reply.result.expect("result")["tools"];
            assert_eq!(tools[0]["name"], "pages-retrieve-a-page");
            assert_eq!(tools[0]["inputSchema"]["type"], "object");
        }
    }

    #[tokio::test]
    async fn unknown_method_and_unknown_tool_are_method_not_found() {
        let p = proxy();
        assert_eq!(
            error_code(dispatch(&p, request("resources/list", json!({}))).await),
            METHOD_NOT_FOUND
        );

        let reply = dispatch(
            &p,
            request("tools/call", json!({"name": "does-not-exist", "arguments": {}})),
        )
        .await
        .expect("reply");
        let err = reply.error.expect("error");
        assert_eq!(err.code, METHOD_NOT_FOUND);
        assert!(err.message.contains("does-not-exist"));
    }

    #[tokio::test]
    async fn bad_params_and_missing_arguments_are_invalid_params() {
        let p = proxy();
        assert_eq!(
            error_code(dispatch(&p, request("tools/call", json!({"arguments": {}}))).await),
            INVALID_PARAMS
        );
        assert_eq!(
            error_code(
                dispatch(
                    &p,
                    request("call", json!({"name": "pages-retrieve-a-page", "arguments": 3}))
                )
                .await
            ),
            INVALID_PARAMS
        );
        assert_eq!(
            error_code(
                dispatch(
                    &p,
                    request("tools/call", json!({"name": "pages-retrieve-a-page"}))
                )
                .await
            ),
            INVALID_PARAMS
        );
    }

    #[tokio::test]
    async fn notifications_and_client_responses_get_no_reply() {
        let p = proxy();
        let note = JsonRpcMessage::notification("notifications/initialized", None);
        assert!(dispatch(&p, note).await.is_none());

        let response = JsonRpcMessage::response(Some(RequestId::Number(9.into())), json!({}));
        assert!(dispatch(&p, response).await.is_none());
    }

    #[tokio::test]
    async fn ping_returns_empty_result() {
        let reply = dispatch(&proxy(), request("ping", Value::Null))
            .await
            .expect("reply");
        assert_eq!(reply.result, Some(json!({})));
    }
}
