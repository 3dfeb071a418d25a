use anyhow::Context as _;
use futures::StreamExt as _;
use futures::stream::BoxStream;
use std::net::TcpListener;
use std::process::Child;
use std::time::{Duration, Instant};

pub struct KillOnDrop(pub Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
    }
}

/// Pick an unused TCP port on localhost.
///
/// Note: this does not reserve the port; it's still possible for another process to bind it
/// before you do.
///
/// # Errors
///
/// Returns an error if binding an ephemeral localhost port fails or if the bound socket's
/// local address cannot be read.
pub fn pick_unused_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("bind ephemeral port")?;
    Ok(listener.local_addr()?.port())
}

/// Poll an HTTP URL until it returns a success status (2xx/3xx).
///
/// # Errors
///
/// Returns an error if the timeout elapses before the endpoint returns a success status.
pub async fn wait_http_ok(url: &str, timeout_dur: Duration) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let start = Instant::now();
    loop {
        if start.elapsed() > timeout_dur {
            anyhow::bail!("timed out waiting for {url}");
        }

        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            _ => tokio::time::sleep(Duration::from_millis(200)).await,
        }
    }
}

/// One named server-sent event (keep-alive comments are skipped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Reads events off an open `text/event-stream` response.
pub struct SseReader {
    stream: BoxStream<'static, Result<sse_stream::Sse, sse_stream::Error>>,
}

impl SseReader {
    #[must_use]
    pub fn new(resp: reqwest::Response) -> Self {
        Self {
            stream: sse_stream::SseStream::from_byte_stream(resp.bytes_stream()).boxed(),
        }
    }

    /// Next event carrying data; `None` once the server ends the stream.
    ///
    /// # Errors
    ///
    /// Returns an error on timeout or if the stream is malformed.
    pub async fn next_event(&mut self, timeout_dur: Duration) -> anyhow::Result<Option<SseEvent>> {
        tokio::time::timeout(timeout_dur, async {
            while let Some(evt) = self.stream.next().await {
                let evt = evt.context("read SSE event")?;
                let data = evt.data.unwrap_or_default();
                if data.trim().is_empty() {
                    continue;
                }
                return Ok(Some(SseEvent {
                    event: evt.event,
                    data,
                }));
            }
            Ok(None)
        })
        .await
        .context("timed out waiting for SSE event")?
    }

    /// Next `message` event parsed as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error on timeout, stream end, or if the data is not JSON.
    pub async fn next_json_message(
        &mut self,
        timeout_dur: Duration,
    ) -> anyhow::Result<serde_json::Value> {
        loop {
            let Some(evt) = self.next_event(timeout_dur).await? else {
                anyhow::bail!("event-stream ended without a JSON message");
            };
            if evt.event.as_deref().unwrap_or("message") != "message" {
                continue;
            }
            return serde_json::from_str(&evt.data).context("parse SSE data as JSON");
        }
    }

    /// Wait until the server ends the stream, discarding any remaining events.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is still open after `timeout_dur`.
    pub async fn wait_closed(&mut self, timeout_dur: Duration) -> anyhow::Result<()> {
        tokio::time::timeout(timeout_dur, async {
            while let Some(evt) = self.stream.next().await {
                if evt.is_err() {
                    break;
                }
            }
        })
        .await
        .context("event-stream still open")
    }
}
