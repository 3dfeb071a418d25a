#![allow(dead_code)]

use anyhow::Context as _;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use mcp_relay::Relay;
use mcp_relay::bridge::SESSION_ID_HEADER;
use mcp_relay::config::RelayConfig;
use mcp_relay::session::SessionRegistry;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use mcp_relay_test_support::{KillOnDrop, SseReader, pick_unused_port, wait_http_ok};

pub const TIMEOUT: Duration = Duration::from_secs(10);
pub const PAGE_TOOL: &str = "pages-retrieve-a-page";

pub const PAGES_SPEC: &str = r#"openapi: "3.0.3"
info:
  title: Pages API
  version: "1.0"
servers:
  - url: https://api.example.com/v1
paths:
  /pages/{page_id}:
    get:
      operationId: retrieve-a-page
      tags: [pages]
      summary: Retrieve a page
      parameters:
        - name: page_id
          in: path
          required: true
          schema: { type: string }
      responses:
        "200":
          description: ok
          content:
            application/json:
              schema:
                type: object
                properties:
                  object: { type: string }
                  id: { type: string }
        "404":
          description: Page not found
"#;

pub fn write_spec(dir: &std::path::Path) -> anyhow::Result<std::path::PathBuf> {
    let path = dir.join("openapi.yaml");
    std::fs::write(&path, PAGES_SPEC).context("write spec")?;
    Ok(path)
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub page_id: String,
    pub authorization: Option<String>,
    pub api_version: Option<String>,
}

type RequestLog = Arc<Mutex<Vec<RecordedRequest>>>;

/// Upstream API stand-in: `GET /v1/pages/{page_id}`, 404 for `missing`.
pub struct MockUpstream {
    pub base_url: String,
    requests: RequestLog,
    task: JoinHandle<()>,
}

impl MockUpstream {
    pub async fn start() -> anyhow::Result<Self> {
        let requests: RequestLog = Arc::default();
        let app = Router::new()
            .route("/v1/pages/{page_id}", get(get_page))
            .layer(Extension(Arc::clone(&requests)));
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind upstream")?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(Self {
            base_url: format!("http://{addr}/v1"),
            requests,
            task,
        })
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn get_page(
    Extension(log): Extension<RequestLog>,
    Path(page_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
    };
    log.lock().push(RecordedRequest {
        page_id: page_id.clone(),
        authorization: header("authorization"),
        api_version: header("notion-version"),
    });

    if page_id == "missing" {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "object": "error",
                "code": "object_not_found",
                "message": "Could not find page"
            })),
        )
            .into_response();
    }
    Json(json!({ "object": "page", "id": page_id })).into_response()
}

/// A relay served in-process on an ephemeral port.
pub struct TestRelay {
    pub base: String,
    pub registry: Arc<SessionRegistry>,
    pub client: reqwest::Client,
    stop: CancellationToken,
    _dir: TempDir,
}

impl TestRelay {
    pub async fn start(upstream_base: &str) -> anyhow::Result<Self> {
        Self::start_with(upstream_base, |_| {}).await
    }

    pub async fn start_with(
        upstream_base: &str,
        tweak: impl FnOnce(&mut RelayConfig),
    ) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let spec_path = write_spec(dir.path())?;

        let mut config = RelayConfig::new(spec_path.to_string_lossy());
        config.default_base_url = Some(upstream_base.to_string());
        config.keep_alive = Duration::from_secs(1);
        tweak(&mut config);

        let relay = Relay::build(&config).await.context("build relay")?;
        let registry = Arc::clone(&relay.registry);
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind relay")?;
        let addr = listener.local_addr()?;

        let stop = CancellationToken::new();
        let shutdown = stop.clone();
        tokio::spawn(async move {
            let _ = relay
                .serve(listener, async move { shutdown.cancelled().await })
                .await;
        });

        Ok(Self {
            base: format!("http://{addr}"),
            registry,
            client: reqwest::Client::new(),
            stop,
            _dir: dir,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    /// Open a stream and read its `endpoint` event.
    pub async fn connect(
        &self,
        credential: &str,
        extra: &[(&str, &str)],
    ) -> anyhow::Result<Connection> {
        let mut query = vec![("credential", credential)];
        query.extend_from_slice(extra);
        let resp = self
            .client
            .get(self.url("/sse"))
            .query(&query)
            .send()
            .await
            .context("open stream")?;
        anyhow::ensure!(
            resp.status() == reqwest::StatusCode::OK,
            "open stream returned {}",
            resp.status()
        );

        let session_id = resp
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .context("missing session id header")?
            .to_string();

        let mut events = SseReader::new(resp);
        let first = events
            .next_event(TIMEOUT)
            .await?
            .context("stream ended before the endpoint event")?;
        anyhow::ensure!(
            first.event.as_deref() == Some("endpoint"),
            "first event was {:?}",
            first.event
        );

        Ok(Connection {
            session_id,
            endpoint: first.data,
            events,
            base: self.base.clone(),
            client: self.client.clone(),
        })
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> anyhow::Result<reqwest::Response> {
        self.client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .context("post message")
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// One open client stream.
pub struct Connection {
    pub session_id: String,
    pub endpoint: String,
    pub events: SseReader,
    base: String,
    client: reqwest::Client,
}

impl Connection {
    /// POST to the endpoint announced on the stream.
    pub async fn post(&self, body: &Value) -> anyhow::Result<reqwest::Response> {
        self.client
            .post(format!("{}{}", self.base, self.endpoint))
            .json(body)
            .send()
            .await
            .context("post message")
    }

    /// Send a request and wait for its reply on the stream.
    pub async fn request(&mut self, id: u64, method: &str, params: Value) -> anyhow::Result<Value> {
        let resp = self
            .post(&json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }))
            .await?;
        anyhow::ensure!(
            resp.status() == reqwest::StatusCode::ACCEPTED,
            "{method} returned {}",
            resp.status()
        );
        let reply = self.events.next_json_message(TIMEOUT).await?;
        anyhow::ensure!(reply.get("id") == Some(&json!(id)), "unexpected reply {reply}");
        Ok(reply)
    }
}

/// The JSON payload inside a tool result's first text block.
pub fn tool_text_json(reply: &Value) -> anyhow::Result<Value> {
    let text = reply
        .pointer("/result/content/0/text")
        .and_then(Value::as_str)
        .context("tool result has no text content")?;
    serde_json::from_str(text).context("tool text is not JSON")
}

pub fn spawn_relay(spec_path: &std::path::Path, upstream: &str, port: u16) -> anyhow::Result<Child> {
    let bin = env!("CARGO_BIN_EXE_mcp-relay");
    Command::new(bin)
        .arg("--spec")
        .arg(spec_path)
        .arg("--bind")
        .arg(format!("127.0.0.1:{port}"))
        .arg("--default-base-url")
        .arg(upstream)
        .arg("--log-level")
        .arg("warn")
        .spawn()
        .context("spawn relay")
}
