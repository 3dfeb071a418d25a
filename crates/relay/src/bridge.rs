//! HTTP surface: stream-open, message submission, session close and liveness.

use crate::error::{RelayError, Result};
use crate::health::health_check;
use crate::jsonrpc::parse_message;
use crate::session::SessionRegistry;
use crate::transport::OutboundFrame;
use axum::body::Bytes;
use axum::extract::{Path, Query};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Router};
use futures::StreamExt as _;
use mcp_relay_openapi_tools::config::ConnectionConfig;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Shared state behind every route.
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    /// Used when a connection does not pass `baseUrl`.
    pub default_base_url: String,
    /// Used when a connection does not pass `apiVersion`.
    pub default_api_version: String,
    pub keep_alive: Duration,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/sse", get(open_stream))
        .route("/message", post(submit_message))
        .route("/messages", post(submit_message))
        .route("/message/{session_id}", post(submit_message_to))
        .route("/messages/{session_id}", post(submit_message_to))
        .route("/sessions/{session_id}", delete(close_session))
        .route("/health", get(health_check))
        .layer(Extension(state))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamParams {
    credential: Option<String>,
    base_url: Option<String>,
    api_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId", alias = "session_id")]
    session_id: Option<String>,
}

async fn open_stream(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<StreamParams>,
) -> Result<Response> {
    let credential = params
        .credential
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| {
            RelayError::Config(
                "missing `credential` query parameter (expected: credential, baseUrl, apiVersion)"
                    .to_string(),
            )
        })?;
    let base_url = params
        .base_url
        .unwrap_or_else(|| state.default_base_url.clone());
    let api_version = params
        .api_version
        .unwrap_or_else(|| state.default_api_version.clone());

    let connection = ConnectionConfig::new(base_url, credential, api_version)
        .map_err(|e| RelayError::Config(e.to_string()))?;
    let opened = state.registry.open(connection).await?;

    let session_id = HeaderValue::from_str(opened.session.id())
        .map_err(|e| RelayError::Internal(format!("session id is not a header value: {e}")))?;
    let events = opened.outbound.map(frame_to_event);
    let sse = Sse::new(events).keep_alive(KeepAlive::new().interval(state.keep_alive));

    Ok((
        [(HeaderName::from_static(SESSION_ID_HEADER), session_id)],
        sse,
    )
        .into_response())
}

fn frame_to_event(frame: OutboundFrame) -> std::result::Result<Event, axum::Error> {
    match frame {
        OutboundFrame::Endpoint(path) => Ok(Event::default().event("endpoint").data(path)),
        OutboundFrame::Message(message) => Event::default().event("message").json_data(&message),
    }
}

async fn submit_message(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    let header_id = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    let explicit = query.session_id.or(header_id);
    accept(&state, explicit.as_deref(), &body).await
}

async fn submit_message_to(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Result<StatusCode> {
    accept(&state, Some(session_id.as_str()), &body).await
}

async fn accept(state: &AppState, explicit: Option<&str>, body: &[u8]) -> Result<StatusCode> {
    let message = parse_message(body)?;
    let session = state.registry.resolve(explicit)?;
    tracing::debug!(
        session_id = %session.id(),
        method = ?message.method,
        "inbound message"
    );
    session.deliver(message).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn close_session(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode> {
    if state.registry.close(&session_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(RelayError::SessionNotFound(session_id))
    }
}
