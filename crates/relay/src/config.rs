//! Process configuration: CLI flags and environment, layered over an optional YAML file.

use crate::error::{RelayError, Result};
use crate::session::RegistrySettings;
use crate::transport::TransportSettings;
use clap::{Parser, ValueEnum};
use mcp_relay_openapi_tools::config::{
    ConverterOptions, DEFAULT_API_VERSION, DEFAULT_VERSION_HEADER, ExecutorSettings, NamePolicy,
    ToolGrouping,
};
use mcp_relay_openapi_tools::safety::{OutboundHttpSafety, RedirectPolicy};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BIND: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 3000));
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 15;
pub const DEFAULT_INBOUND_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "mcp-relay",
    version,
    about = "Expose an OpenAPI-described HTTP API as MCP tools over a server-push stream"
)]
pub struct Args {
    /// YAML config file (camelCase keys). Flags and env vars override its values.
    #[arg(long, env = "MCP_RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// OpenAPI document: file path or http(s) URL.
    #[arg(long, env = "MCP_RELAY_SPEC")]
    pub spec: Option<String>,

    /// Address to listen on [default: 127.0.0.1:3000].
    #[arg(long, env = "MCP_RELAY_BIND")]
    pub bind: Option<SocketAddr>,

    /// Base URL for connections that do not pass `baseUrl` [default: the document's first server].
    #[arg(long, env = "MCP_RELAY_DEFAULT_BASE_URL")]
    pub default_base_url: Option<String>,

    /// API version for connections that do not pass `apiVersion` [default: 2022-06-28].
    #[arg(long, env = "MCP_RELAY_DEFAULT_API_VERSION")]
    pub default_api_version: Option<String>,

    /// Header carrying the API version [default: Notion-Version].
    #[arg(long, env = "MCP_RELAY_VERSION_HEADER")]
    pub version_header: Option<String>,

    /// Resource prefix for tool names: `tag`, `none` or `fixed:<name>` [default: tag].
    #[arg(long, env = "MCP_RELAY_TOOL_GROUPING")]
    pub tool_grouping: Option<ToolGrouping>,

    /// Names over 64 chars: `truncate` or `hash-suffix` [default: truncate].
    #[arg(long, env = "MCP_RELAY_TOOL_NAME_POLICY")]
    pub tool_name_policy: Option<NamePolicy>,

    /// Per-call upstream timeout in seconds [default: none].
    #[arg(long, env = "MCP_RELAY_CALL_TIMEOUT_SECS")]
    pub call_timeout_secs: Option<u64>,

    /// Close sessions idle this many seconds [default: never].
    #[arg(long, env = "MCP_RELAY_SESSION_IDLE_TIMEOUT_SECS")]
    pub session_idle_timeout_secs: Option<u64>,

    /// Keep-alive comment interval on open streams [default: 15].
    #[arg(long, env = "MCP_RELAY_KEEP_ALIVE_SECS")]
    pub keep_alive_secs: Option<u64>,

    /// Inbound messages buffered per session [default: 64].
    #[arg(long, env = "MCP_RELAY_INBOUND_QUEUE_CAPACITY")]
    pub inbound_queue_capacity: Option<usize>,

    /// Maximum upstream response size in bytes [default: unlimited].
    #[arg(long, env = "MCP_RELAY_MAX_RESPONSE_BYTES")]
    pub max_response_bytes: Option<usize>,

    /// Refuse base URLs that resolve to private, loopback or link-local addresses.
    #[arg(long, env = "MCP_RELAY_DENY_PRIVATE_NETWORKS")]
    pub deny_private_networks: bool,

    /// Only allow these upstream hosts (comma-separated).
    #[arg(long, env = "MCP_RELAY_ALLOWED_HOSTS", value_delimiter = ',')]
    pub allowed_hosts: Vec<String>,

    /// Return upstream 3xx responses instead of following them (followed hops are re-checked
    /// against the host and network rules).
    #[arg(long, env = "MCP_RELAY_NO_FOLLOW_REDIRECTS")]
    pub no_follow_redirects: bool,

    /// Log level when `RUST_LOG` is unset [default: info].
    #[arg(long, env = "MCP_RELAY_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[arg(long, env = "MCP_RELAY_LOG_FORMAT", value_enum)]
    pub log_format: Option<LogFormat>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileConfig {
    pub spec: Option<String>,
    pub bind: Option<SocketAddr>,
    pub default_base_url: Option<String>,
    pub default_api_version: Option<String>,
    pub version_header: Option<String>,
    pub tool_grouping: Option<ToolGrouping>,
    pub tool_name_policy: Option<NamePolicy>,
    pub call_timeout_secs: Option<u64>,
    pub session_idle_timeout_secs: Option<u64>,
    pub keep_alive_secs: Option<u64>,
    pub inbound_queue_capacity: Option<usize>,
    pub max_response_bytes: Option<usize>,
    pub deny_private_networks: Option<bool>,
    pub allowed_hosts: Option<Vec<String>>,
    pub follow_redirects: Option<bool>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
}

/// Fully resolved settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub spec: String,
    pub bind: SocketAddr,
    pub default_base_url: Option<String>,
    pub default_api_version: String,
    pub version_header: String,
    pub tool_grouping: ToolGrouping,
    pub tool_name_policy: NamePolicy,
    pub call_timeout: Option<Duration>,
    pub session_idle_timeout: Option<Duration>,
    pub keep_alive: Duration,
    pub inbound_queue_capacity: usize,
    pub max_response_bytes: Option<usize>,
    pub deny_private_networks: bool,
    pub allowed_hosts: Vec<String>,
    pub follow_redirects: bool,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl RelayConfig {
    /// Defaults for serving `spec`.
    #[must_use]
    pub fn new(spec: impl Into<String>) -> Self {
        Self {
            spec: spec.into(),
            bind: DEFAULT_BIND,
            default_base_url: None,
            default_api_version: DEFAULT_API_VERSION.to_string(),
            version_header: DEFAULT_VERSION_HEADER.to_string(),
            tool_grouping: ToolGrouping::default(),
            tool_name_policy: NamePolicy::default(),
            call_timeout: None,
            session_idle_timeout: None,
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            inbound_queue_capacity: DEFAULT_INBOUND_QUEUE_CAPACITY,
            max_response_bytes: None,
            deny_private_networks: false,
            allowed_hosts: Vec::new(),
            follow_redirects: true,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }

    /// Resolve CLI/env arguments, reading `--config` if given.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file cannot be read or parsed, or no spec location is configured.
    pub fn load(args: Args) -> Result<Self> {
        let file = match &args.config {
            Some(path) => load_file(path)?,
            None => FileConfig::default(),
        };
        Self::merge(args, file)
    }

    /// CLI/env values win over file values, which win over defaults.
    ///
    /// # Errors
    ///
    /// Returns `Config` if no spec location is configured or a value is out of range.
    pub fn merge(args: Args, file: FileConfig) -> Result<Self> {
        let spec = args.spec.or(file.spec).ok_or_else(|| {
            RelayError::Config("an OpenAPI spec is required (--spec or `spec` in --config)".into())
        })?;
        let mut cfg = Self::new(spec);

        if let Some(bind) = args.bind.or(file.bind) {
            cfg.bind = bind;
        }
        cfg.default_base_url = args.default_base_url.or(file.default_base_url);
        if let Some(v) = args.default_api_version.or(file.default_api_version) {
            cfg.default_api_version = v;
        }
        if let Some(v) = args.version_header.or(file.version_header) {
            cfg.version_header = v;
        }
        if let Some(v) = args.tool_grouping.or(file.tool_grouping) {
            cfg.tool_grouping = v;
        }
        if let Some(v) = args.tool_name_policy.or(file.tool_name_policy) {
            cfg.tool_name_policy = v;
        }
        cfg.call_timeout = positive_secs(args.call_timeout_secs.or(file.call_timeout_secs));
        cfg.session_idle_timeout = positive_secs(
            args.session_idle_timeout_secs
                .or(file.session_idle_timeout_secs),
        );
        if let Some(secs) = args.keep_alive_secs.or(file.keep_alive_secs) {
            if secs == 0 {
                return Err(RelayError::Config("keepAliveSecs must be at least 1".into()));
            }
            cfg.keep_alive = Duration::from_secs(secs);
        }
        if let Some(cap) = args.inbound_queue_capacity.or(file.inbound_queue_capacity) {
            if cap == 0 {
                return Err(RelayError::Config(
                    "inboundQueueCapacity must be at least 1".into(),
                ));
            }
            cfg.inbound_queue_capacity = cap;
        }
        cfg.max_response_bytes = args.max_response_bytes.or(file.max_response_bytes);
        cfg.deny_private_networks =
            args.deny_private_networks || file.deny_private_networks.unwrap_or(false);
        cfg.allowed_hosts = if args.allowed_hosts.is_empty() {
            file.allowed_hosts.unwrap_or_default()
        } else {
            args.allowed_hosts
        };
        cfg.follow_redirects =
            !args.no_follow_redirects && file.follow_redirects.unwrap_or(true);
        if let Some(level) = args.log_level.or(file.log_level) {
            cfg.log_level = level;
        }
        if let Some(format) = args.log_format.or(file.log_format) {
            cfg.log_format = format;
        }
        Ok(cfg)
    }

    #[must_use]
    pub fn converter_options(&self) -> ConverterOptions {
        ConverterOptions {
            grouping: self.tool_grouping.clone(),
            name_policy: self.tool_name_policy,
            base_url: self.default_base_url.clone(),
            spec_location: Some(self.spec.clone()),
        }
    }

    #[must_use]
    pub fn safety(&self) -> OutboundHttpSafety {
        let allowed_hosts = if self.allowed_hosts.is_empty() {
            None
        } else {
            Some(
                self.allowed_hosts
                    .iter()
                    .map(|h| h.trim().to_ascii_lowercase())
                    .filter(|h| !h.is_empty())
                    .collect::<HashSet<_>>(),
            )
        };
        OutboundHttpSafety {
            allowed_hosts,
            allow_private_networks: !self.deny_private_networks,
            max_response_bytes: self.max_response_bytes,
            redirects: if self.follow_redirects {
                RedirectPolicy::Checked
            } else {
                RedirectPolicy::None
            },
        }
    }

    #[must_use]
    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            executor: ExecutorSettings {
                version_header: self.version_header.clone(),
                call_timeout: self.call_timeout,
                safety: self.safety(),
            },
            transport: TransportSettings {
                inbound_capacity: self.inbound_queue_capacity,
                ..TransportSettings::default()
            },
            idle_timeout: self.session_idle_timeout,
        }
    }
}

fn positive_secs(secs: Option<u64>) -> Option<Duration> {
    secs.filter(|s| *s > 0).map(Duration::from_secs)
}

fn load_file(path: &Path) -> Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| RelayError::Config(format!("read config {}: {e}", path.display())))?;
    serde_yaml::from_str(&raw)
        .map_err(|e| RelayError::Config(format!("parse config {}: {e}", path.display())))
}
