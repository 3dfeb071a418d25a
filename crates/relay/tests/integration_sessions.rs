mod common;

use anyhow::Context as _;
use common::{MockUpstream, PAGE_TOOL, TIMEOUT, TestRelay};
use serde_json::{Value, json};
use std::time::{Duration, Instant};

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}

#[tokio::test]
async fn stream_without_credential_is_rejected() -> anyhow::Result<()> {
    let upstream = MockUpstream::start().await?;
    let relay = TestRelay::start(&upstream.base_url).await?;

    let resp = relay.client.get(relay.url("/sse")).send().await?;
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await?;
    assert_eq!(body["error"], "invalid_config");
    assert!(relay.registry.is_empty());
    Ok(())
}

#[tokio::test]
async fn endpoint_event_names_the_session() -> anyhow::Result<()> {
    let upstream = MockUpstream::start().await?;
    let relay = TestRelay::start(&upstream.base_url).await?;

    let conn = relay.connect("secret", &[]).await?;
    assert_eq!(
        conn.endpoint,
        format!("/message?sessionId={}", conn.session_id)
    );
    assert_eq!(relay.registry.len(), 1);
    let session = relay
        .registry
        .get(&conn.session_id)
        .context("session registered")?;
    assert_eq!(session.connection().credential, "secret");
    Ok(())
}

#[tokio::test]
async fn sessions_keep_their_own_credentials() -> anyhow::Result<()> {
    let upstream = MockUpstream::start().await?;
    let relay = TestRelay::start(&upstream.base_url).await?;

    let mut a = relay.connect("secret-a", &[]).await?;
    let mut b = relay
        .connect("secret-b", &[("apiVersion", "2025-09-03")])
        .await?;
    assert_ne!(a.session_id, b.session_id);

    let args = |page: &str| json!({ "name": PAGE_TOOL, "arguments": { "page_id": page } });
    let reply_a = a.request(1, "tools/call", args("page-a")).await?;
    let reply_b = b.request(1, "tools/call", args("page-b")).await?;
    assert_eq!(common::tool_text_json(&reply_a)?["id"], "page-a");
    assert_eq!(common::tool_text_json(&reply_b)?["id"], "page-b");

    let seen = upstream.requests();
    assert_eq!(seen.len(), 2);
    let by_page = |page: &str| {
        seen.iter()
            .find(|r| r.page_id == page)
            .cloned()
            .context("upstream request recorded")
    };
    let ra = by_page("page-a")?;
    let rb = by_page("page-b")?;
    assert_eq!(ra.authorization.as_deref(), Some("Bearer secret-a"));
    assert_eq!(ra.api_version.as_deref(), Some("2022-06-28"));
    assert_eq!(rb.authorization.as_deref(), Some("Bearer secret-b"));
    assert_eq!(rb.api_version.as_deref(), Some("2025-09-03"));
    Ok(())
}

#[tokio::test]
async fn unknown_session_id_is_not_found() -> anyhow::Result<()> {
    let upstream = MockUpstream::start().await?;
    let relay = TestRelay::start(&upstream.base_url).await?;
    let _conn = relay.connect("secret", &[]).await?;

    let ping = json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" });
    let resp = relay.post_json("/message?sessionId=nope", &ping).await?;
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    let body: Value = resp.json().await?;
    assert_eq!(body["error"], "session_not_found");

    let resp = relay.post_json("/messages/nope", &ping).await?;
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn implicit_routing_only_with_a_single_session() -> anyhow::Result<()> {
    let upstream = MockUpstream::start().await?;
    let relay = TestRelay::start(&upstream.base_url).await?;

    let ping = json!({ "jsonrpc": "2.0", "id": 7, "method": "ping" });
    let resp = relay.post_json("/message", &ping).await?;
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    let mut only = relay.connect("secret", &[]).await?;
    let resp = relay.post_json("/message", &ping).await?;
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
    let reply = only.events.next_json_message(TIMEOUT).await?;
    assert_eq!(reply["id"], 7);
    assert_eq!(reply["result"], json!({}));

    let _second = relay.connect("other", &[]).await?;
    let resp = relay.post_json("/message", &ping).await?;
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await?;
    assert_eq!(body["error"], "session_required");
    Ok(())
}

#[tokio::test]
async fn session_id_from_path_or_header() -> anyhow::Result<()> {
    let upstream = MockUpstream::start().await?;
    let relay = TestRelay::start(&upstream.base_url).await?;
    let mut conn = relay.connect("secret", &[]).await?;
    let _other = relay.connect("other", &[]).await?;

    let resp = relay
        .post_json(
            &format!("/messages/{}", conn.session_id),
            &json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }),
        )
        .await?;
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
    assert_eq!(conn.events.next_json_message(TIMEOUT).await?["id"], 1);

    let resp = relay
        .client
        .post(relay.url("/message"))
        .header("mcp-session-id", &conn.session_id)
        .json(&json!({ "jsonrpc": "2.0", "id": 2, "method": "ping" }))
        .send()
        .await?;
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
    assert_eq!(conn.events.next_json_message(TIMEOUT).await?["id"], 2);
    Ok(())
}

#[tokio::test]
async fn notifications_get_no_reply() -> anyhow::Result<()> {
    let upstream = MockUpstream::start().await?;
    let relay = TestRelay::start(&upstream.base_url).await?;
    let mut conn = relay.connect("secret", &[]).await?;

    let resp = conn
        .post(&json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
        .await?;
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);

    // The next message on the stream is the ping reply, not anything for the notification.
    let reply = conn.request(3, "ping", json!({})).await?;
    assert_eq!(reply["result"], json!({}));
    Ok(())
}

#[tokio::test]
async fn malformed_body_gets_parse_error() -> anyhow::Result<()> {
    let upstream = MockUpstream::start().await?;
    let relay = TestRelay::start(&upstream.base_url).await?;
    let conn = relay.connect("secret", &[]).await?;

    let resp = relay
        .client
        .post(relay.url(&conn.endpoint))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await?;
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await?;
    assert_eq!(body["jsonrpc"], "2.0");
    assert_eq!(body["id"], Value::Null);
    assert_eq!(body["error"]["code"], -32700);
    Ok(())
}

#[tokio::test]
async fn delete_closes_the_stream() -> anyhow::Result<()> {
    let upstream = MockUpstream::start().await?;
    let relay = TestRelay::start(&upstream.base_url).await?;
    let mut conn = relay.connect("secret", &[]).await?;

    let path = format!("/sessions/{}", conn.session_id);
    let resp = relay.client.delete(relay.url(&path)).send().await?;
    assert_eq!(resp.status(), reqwest::StatusCode::NO_CONTENT);
    conn.events.wait_closed(TIMEOUT).await?;
    assert!(relay.registry.is_empty());

    let resp = conn
        .post(&json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }))
        .await?;
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    let resp = relay.client.delete(relay.url(&path)).send().await?;
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn dropped_stream_unregisters_the_session() -> anyhow::Result<()> {
    let upstream = MockUpstream::start().await?;
    let relay = TestRelay::start(&upstream.base_url).await?;
    let conn = relay.connect("secret", &[]).await?;
    let id = conn.session_id.clone();
    assert_eq!(relay.registry.len(), 1);

    drop(conn);
    assert!(
        wait_until(|| relay.registry.get(&id).is_none()).await,
        "session should be removed once the client disconnects"
    );
    Ok(())
}

#[tokio::test]
async fn idle_sessions_are_reaped() -> anyhow::Result<()> {
    let upstream = MockUpstream::start().await?;
    let relay = TestRelay::start_with(&upstream.base_url, |cfg| {
        cfg.session_idle_timeout = Some(Duration::from_secs(1));
    })
    .await?;
    let mut conn = relay.connect("secret", &[]).await?;

    conn.events.wait_closed(TIMEOUT).await?;
    assert!(relay.registry.is_empty());
    Ok(())
}
