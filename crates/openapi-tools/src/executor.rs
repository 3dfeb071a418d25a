//! Per-connection HTTP execution of one [`OperationRecord`].

use crate::config::{ConnectionConfig, ExecutorSettings};
use crate::converter::{BodyShape, OperationRecord, ParamLocation};
use crate::error::{OpenApiToolsError, Result, UpstreamError};
use crate::safety::sanitize_reqwest_error;
use base64::Engine as _;
use reqwest::Client;
use reqwest::header::{HeaderName, HeaderValue};
use serde_json::{Map, Value, json};
use url::Url;

/// Decoded upstream reply.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamResponse {
    pub status: u16,
    /// Parsed JSON when possible, else a JSON string (or a base64 object for binary payloads).
    pub body: Value,
}

struct QueryPair {
    key: String,
    value: String,
}

struct RequestParts {
    path: String,
    query: Vec<QueryPair>,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Option<Value>,
}

/// Executes operations against one connection's base URL with one connection's credential.
#[derive(Debug, Clone)]
pub struct RequestExecutor {
    connection: ConnectionConfig,
    settings: ExecutorSettings,
    client: Client,
}

impl RequestExecutor {
    /// Create an executor with its own HTTP client, built from the settings' safety policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(connection: ConnectionConfig, settings: ExecutorSettings) -> Result<Self> {
        let client = settings.safety.build_client()?;
        Ok(Self::with_client(connection, settings, client))
    }

    /// Create an executor sharing an existing connection pool.
    ///
    /// The client should come from [`OutboundHttpSafety::build_client`] so redirects obey the
    /// same policy as the first request.
    ///
    /// [`OutboundHttpSafety::build_client`]: crate::safety::OutboundHttpSafety::build_client
    #[must_use]
    pub fn with_client(
        connection: ConnectionConfig,
        settings: ExecutorSettings,
        client: Client,
    ) -> Self {
        Self {
            connection,
            settings,
            client,
        }
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionConfig {
        &self.connection
    }

    /// Issue the HTTP request for `operation` with `arguments`.
    ///
    /// # Errors
    ///
    /// - `InvalidArguments` if a required argument is missing or arguments are not an object.
    /// - `Upstream` for transport failures, blocked destinations and non-2xx responses.
    pub async fn execute(
        &self,
        operation: &OperationRecord,
        arguments: &Value,
    ) -> Result<UpstreamResponse> {
        let parts = build_request_parts(operation, arguments)?;
        let url = build_url(&self.connection.base_url, &parts.path, &parts.query)?;

        self.settings
            .safety
            .check_url(&url)
            .await
            .map_err(|e| OpenApiToolsError::Upstream(UpstreamError::transport(e.to_string())))?;

        let mut request = self
            .client
            .request(operation.method.to_reqwest(), url)
            .bearer_auth(&self.connection.credential)
            .header(
                self.settings.version_header.as_str(),
                self.connection.api_version.as_str(),
            );
        for (name, value) in parts.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &parts.body {
            request = request.json(body);
        }
        if let Some(timeout) = self.settings.call_timeout {
            request = request.timeout(timeout);
        }

        tracing::debug!(
            operation = %operation.operation_id,
            method = %operation.method,
            path = %parts.path,
            "calling upstream API"
        );

        let response = request.send().await.map_err(|e| {
            OpenApiToolsError::Upstream(UpstreamError::transport(sanitize_reqwest_error(&e)))
        })?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let bytes = read_body_limited(
            response,
            status.as_u16(),
            self.settings.safety.max_response_bytes,
        )
        .await?;
        let body = decode_body(&bytes, content_type.as_deref());

        if status.is_success() {
            Ok(UpstreamResponse {
                status: status.as_u16(),
                body,
            })
        } else {
            tracing::debug!(
                operation = %operation.operation_id,
                status = status.as_u16(),
                "upstream API returned an error status"
            );
            Err(OpenApiToolsError::Upstream(UpstreamError {
                status: Some(status.as_u16()),
                body,
            }))
        }
    }
}

/// Header arguments must form a valid header, else the request could not be sent at all.
fn header_pair(name: &str, value: &Value) -> Result<(HeaderName, HeaderValue)> {
    let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
        OpenApiToolsError::InvalidArguments(format!("'{name}' is not a valid header name"))
    })?;
    let header_value = HeaderValue::from_str(&value_to_string(value)).map_err(|_| {
        OpenApiToolsError::InvalidArguments(format!(
            "header parameter '{name}' has a value that is not a valid header value"
        ))
    })?;
    Ok((header_name, header_value))
}

fn build_request_parts(operation: &OperationRecord, arguments: &Value) -> Result<RequestParts> {
    let empty = Map::new();
    let args = match arguments {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            return Err(OpenApiToolsError::InvalidArguments(format!(
                "arguments must be an object, got {}",
                json_type_name(other)
            )));
        }
    };

    let mut path = operation.path_template.clone();
    let mut query = Vec::new();
    let mut headers = Vec::new();
    let mut body_fields = Map::new();
    let mut whole_body: Option<Value> = None;

    for param in &operation.parameters {
        let value = args.get(&param.name).filter(|v| !v.is_null());
        let Some(value) = value else {
            if param.required {
                return Err(OpenApiToolsError::InvalidArguments(format!(
                    "Missing required parameter: {}",
                    param.name
                )));
            }
            continue;
        };

        match param.location {
            ParamLocation::Path => {
                let segment = encode_component(&value_to_string(value));
                path = path.replace(&format!("{{{}}}", param.name), &segment);
            }
            ParamLocation::Query => serialize_query_param(&param.name, value, &mut query),
            ParamLocation::Header => headers.push(header_pair(&param.name, value)?),
            ParamLocation::Body => match operation.request_body {
                Some(BodyShape::Whole) => whole_body = Some(value.clone()),
                _ => {
                    body_fields.insert(param.name.clone(), value.clone());
                }
            },
        }
    }

    let body = match operation.request_body {
        Some(BodyShape::Whole) => whole_body,
        Some(BodyShape::Fields) => Some(Value::Object(body_fields)),
        None => None,
    };

    if !path.starts_with('/') {
        path = format!("/{path}");
    }

    Ok(RequestParts {
        path,
        query,
        headers,
        body,
    })
}

/// Form style with explode: arrays repeat the key, objects become `name[key]` pairs.
fn serialize_query_param(name: &str, value: &Value, out: &mut Vec<QueryPair>) {
    match value {
        Value::Array(items) => out.extend(items.iter().map(|v| QueryPair {
            key: name.to_string(),
            value: value_to_string(v),
        })),
        Value::Object(map) => out.extend(map.iter().map(|(k, v)| QueryPair {
            key: format!("{name}[{k}]"),
            value: value_to_string(v),
        })),
        scalar => out.push(QueryPair {
            key: name.to_string(),
            value: value_to_string(scalar),
        }),
    }
}

fn build_url(base_url: &str, path: &str, query: &[QueryPair]) -> Result<Url> {
    let raw = format!("{}{}", base_url.trim_end_matches('/'), path);
    let mut url = Url::parse(&raw)
        .map_err(|e| OpenApiToolsError::InvalidArguments(format!("Invalid request URL: {e}")))?;

    if !query.is_empty() {
        let encoded = query
            .iter()
            .map(|p| format!("{}={}", encode_component(&p.key), encode_component(&p.value)))
            .collect::<Vec<_>>()
            .join("&");
        url.set_query(Some(&encoded));
    }

    Ok(url)
}

async fn read_body_limited(
    mut response: reqwest::Response,
    status: u16,
    max_bytes: Option<usize>,
) -> Result<Vec<u8>> {
    let too_large = |message: String| {
        OpenApiToolsError::Upstream(UpstreamError {
            status: Some(status),
            body: Value::String(message),
        })
    };
    let transport = |e: reqwest::Error| {
        OpenApiToolsError::Upstream(UpstreamError::transport(sanitize_reqwest_error(&e)))
    };

    let Some(max) = max_bytes else {
        return Ok(response.bytes().await.map_err(transport)?.to_vec());
    };

    if let Some(len) = response.content_length()
        && len > max as u64
    {
        return Err(too_large(format!("Response too large: {len} bytes (limit {max})")));
    }

    let mut out: Vec<u8> = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(transport)? {
        if out.len().saturating_add(chunk.len()) > max {
            return Err(too_large(format!("Response too large: exceeded {max} bytes")));
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

fn decode_body(bytes: &[u8], content_type: Option<&str>) -> Value {
    match std::str::from_utf8(bytes) {
        Ok("") => Value::Null,
        Ok(text) => serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())),
        Err(_) => json!({
            "encoding": "base64",
            "mimeType": content_type,
            "data": base64::engine::general_purpose::STANDARD.encode(bytes),
        }),
    }
}

/// Percent-encode everything except RFC 3986 unreserved characters.
fn encode_component(s: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0F) as usize] as char);
        }
    }
    out
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        _ => value.to_string(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
