use crate::error::{OpenApiToolsError, Result};
use crate::safety::OutboundHttpSafety;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Header carrying the API version tag unless configured otherwise.
pub const DEFAULT_VERSION_HEADER: &str = "Notion-Version";

/// API version tag sent when a connection does not ask for another one.
pub const DEFAULT_API_VERSION: &str = "2022-06-28";

/// Per-connection settings, fixed for the lifetime of one session.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub base_url: String,
    pub credential: String,
    pub api_version: String,
}

impl ConnectionConfig {
    /// Build and validate a connection config.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if the credential is empty or the base URL is not an absolute
    /// `http(s)` URL.
    pub fn new(
        base_url: impl Into<String>,
        credential: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Result<Self> {
        let cfg = Self {
            base_url: base_url.into(),
            credential: credential.into(),
            api_version: api_version.into(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.credential.trim().is_empty() {
            return Err(OpenApiToolsError::Config(
                "credential must not be empty".to_string(),
            ));
        }
        if self.api_version.trim().is_empty() {
            return Err(OpenApiToolsError::Config(
                "apiVersion must not be empty".to_string(),
            ));
        }
        // Both end up in request headers on every call.
        for (field, value) in [
            ("credential", self.credential.as_str()),
            ("apiVersion", self.api_version.as_str()),
        ] {
            if reqwest::header::HeaderValue::from_str(value).is_err() {
                return Err(OpenApiToolsError::Config(format!(
                    "{field} contains characters not allowed in an HTTP header"
                )));
            }
        }
        let url = Url::parse(&self.base_url).map_err(|e| {
            OpenApiToolsError::Config(format!("Invalid baseUrl '{}': {e}", self.base_url))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(OpenApiToolsError::Config(format!(
                "Invalid baseUrl '{}': must be an absolute http(s) URL",
                self.base_url
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("base_url", &self.base_url)
            .field("credential", &"<redacted>")
            .field("api_version", &self.api_version)
            .finish()
    }
}

/// How operations are grouped into resources (the `{resource}-` tool name prefix).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ToolGrouping {
    /// First `OpenAPI` tag of the operation; untagged operations have no resource.
    #[default]
    Tag,
    /// Every operation belongs to one named resource.
    Fixed(String),
    /// No resource prefix at all.
    None,
}

impl FromStr for ToolGrouping {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "tag" => Ok(Self::Tag),
            "none" => Ok(Self::None),
            other => match other.strip_prefix("fixed:") {
                Some(name) if !name.trim().is_empty() => Ok(Self::Fixed(name.trim().to_string())),
                _ => Err(format!(
                    "invalid tool grouping '{other}' (expected 'tag', 'none' or 'fixed:<name>')"
                )),
            },
        }
    }
}

impl TryFrom<String> for ToolGrouping {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ToolGrouping> for String {
    fn from(value: ToolGrouping) -> Self {
        match value {
            ToolGrouping::Tag => "tag".to_string(),
            ToolGrouping::None => "none".to_string(),
            ToolGrouping::Fixed(name) => format!("fixed:{name}"),
        }
    }
}

/// What to do with tool names longer than [`crate::converter::MAX_TOOL_NAME_LEN`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NamePolicy {
    /// Cut to exactly 64 characters. Distinct long names may collide; kept as the default so
    /// exposed names stay identical to existing deployments.
    #[default]
    Truncate,
    /// Keep a 55 character prefix and append `-` plus 8 hex chars of the full name's SHA-256.
    HashSuffix,
}

impl FromStr for NamePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "truncate" => Ok(Self::Truncate),
            "hash-suffix" => Ok(Self::HashSuffix),
            other => Err(format!(
                "invalid tool name policy '{other}' (expected 'truncate' or 'hash-suffix')"
            )),
        }
    }
}

/// Options for converting one `OpenAPI` document.
#[derive(Debug, Clone, Default)]
pub struct ConverterOptions {
    pub grouping: ToolGrouping,
    pub name_policy: NamePolicy,
    /// Overrides the document's `servers[0].url`.
    pub base_url: Option<String>,
    /// Where the document was loaded from; used to resolve relative server URLs.
    pub spec_location: Option<String>,
}

/// Process-wide settings shared by every [`crate::executor::RequestExecutor`].
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub version_header: String,
    /// Per-call timeout. `None` leaves calls unbounded.
    pub call_timeout: Option<Duration>,
    pub safety: OutboundHttpSafety,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            version_header: DEFAULT_VERSION_HEADER.to_string(),
            call_timeout: None,
            safety: OutboundHttpSafety::permissive(),
        }
    }
}
