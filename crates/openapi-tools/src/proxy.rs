//! Typed `list_tools` / `call_tool` interface over one converted document and one connection.

use crate::converter::{ConvertedSpec, ToolDefinition};
use crate::error::{OpenApiToolsError, Result, UpstreamError};
use crate::executor::RequestExecutor;
use rmcp::model::{CallToolResult, Content, Tool};
use serde_json::{Map, Value};
use std::sync::Arc;

/// The converted tool surface bound to one connection's executor.
///
/// The converted document is shared by every proxy; the executor (and with it the credential)
/// belongs to exactly one session.
#[derive(Debug, Clone)]
pub struct ToolProxy {
    spec: Arc<ConvertedSpec>,
    executor: RequestExecutor,
}

impl ToolProxy {
    #[must_use]
    pub fn new(spec: Arc<ConvertedSpec>, executor: RequestExecutor) -> Self {
        Self { spec, executor }
    }

    /// All tools in declaration order.
    #[must_use]
    pub fn list_tools(&self) -> Vec<Tool> {
        self.spec.tools().iter().map(ToolDefinition::to_tool).collect()
    }

    #[must_use]
    pub fn definitions(&self) -> &[ToolDefinition] {
        self.spec.tools()
    }

    #[must_use]
    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    /// Execute a tool call.
    ///
    /// Upstream failures are reported inside the result (`isError: true`) rather than as `Err`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTool` for names outside the converted surface and `InvalidArguments` when
    /// the request cannot be formed from `arguments`.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        let operation = self
            .spec
            .operation(name)
            .cloned()
            .ok_or_else(|| OpenApiToolsError::UnknownTool(name.to_string()))?;

        match self.executor.execute(&operation, &arguments).await {
            Ok(response) => Ok(CallToolResult::success(vec![Content::text(body_text(
                &response.body,
            ))])),
            Err(OpenApiToolsError::Upstream(upstream)) => {
                tracing::info!(
                    tool = %name,
                    status = ?upstream.status,
                    "upstream API call failed"
                );
                let payload = error_payload(&upstream);
                Ok(CallToolResult::error(vec![Content::text(body_text(&payload))]))
            }
            Err(e) => Err(e),
        }
    }
}

/// `{"status":"error","httpStatus":..}` merged with the upstream body's fields.
fn error_payload(upstream: &UpstreamError) -> Value {
    let mut payload = Map::new();
    match &upstream.body {
        Value::Object(fields) => payload.extend(fields.clone()),
        Value::Null => {}
        other => {
            payload.insert("body".to_string(), other.clone());
        }
    }
    payload.insert("status".to_string(), Value::String("error".to_string()));
    payload.insert(
        "httpStatus".to_string(),
        upstream.status.map_or(Value::Null, Value::from),
    );
    Value::Object(payload)
}

fn body_text(body: &Value) -> String {
    match body {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_else(|_| other.to_string()),
    }
}
