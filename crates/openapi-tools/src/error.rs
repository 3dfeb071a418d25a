//! Error types for `mcp-relay-openapi-tools`.

use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Main error type for `OpenAPI` tooling.
#[derive(Error, Debug)]
pub enum OpenApiToolsError {
    /// Configuration errors (missing base URL, invalid connection parameters).
    #[error("Configuration error: {0}")]
    Config(String),

    /// `OpenAPI` errors (spec structure, unresolvable `$ref`s).
    #[error("OpenAPI error: {0}")]
    OpenApi(String),

    #[error("OpenAPI error: failed to fetch spec from '{url}': {message}")]
    OpenApiSpecFetch { url: String, message: String },

    #[error("OpenAPI error: failed to read spec file '{path}': {source}")]
    OpenApiSpecReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("OpenAPI error: failed to parse OpenAPI spec from '{location}': {source}")]
    OpenApiSpecParse {
        location: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// Parameter collision errors.
    #[error("Parameter collision: {0}")]
    ParamCollision(String),

    /// The requested tool is not part of the converted surface.
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// The request could not be formed from the supplied arguments.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// The described API answered with a failure or could not be reached.
    #[error("Upstream API error: {0}")]
    Upstream(UpstreamError),

    #[error("Internal error: {0}")]
    Internal(String),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl OpenApiToolsError {
    /// True when the error came from the described API rather than from forming the request.
    #[must_use]
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream(_))
    }
}

/// Failure reported by (or while reaching) the upstream API.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamError {
    /// HTTP status, `None` for transport failures (DNS, connect, timeout).
    pub status: Option<u16>,
    /// Parsed JSON body when the payload was JSON, otherwise the raw text.
    pub body: Value,
}

impl UpstreamError {
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            body: Value::String(message.into()),
        }
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "API returned {status}: {}", self.body),
            None => write!(f, "request failed: {}", self.body),
        }
    }
}

/// Result type alias for `OpenAPI` tooling operations.
pub type Result<T> = std::result::Result<T, OpenApiToolsError>;
