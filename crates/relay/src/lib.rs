//! `mcp-relay`: serve the tools of one `OpenAPI` document to many clients, each over its own
//! server-push stream with its own credential, base URL and API version.
//!
//! - [`session`] owns the session table and per-session workers.
//! - [`transport`] is the session's message channel (one SSE implementation).
//! - [`bridge`] maps HTTP routes onto the registry.
//! - [`dispatch`] answers MCP methods using a session's `ToolProxy`.

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod jsonrpc;
pub mod session;
pub mod transport;

use crate::bridge::AppState;
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::session::SessionRegistry;
use axum::Router;
use mcp_relay_openapi_tools::converter::{SpecConverter, load_spec};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// A built relay: the router plus the registry it serves.
pub struct Relay {
    pub router: Router,
    pub registry: Arc<SessionRegistry>,
}

impl Relay {
    /// Load and convert the configured document and assemble the HTTP surface.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be loaded or converted.
    pub async fn build(config: &RelayConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| RelayError::Startup(format!("Failed to build HTTP client: {e}")))?;
        let document = load_spec(&config.spec, &http)
            .await
            .map_err(|e| RelayError::Startup(e.to_string()))?;
        let converted = SpecConverter::new(config.converter_options())
            .convert(&document)
            .map_err(|e| RelayError::Startup(e.to_string()))?;

        let default_base_url = converted.base_url().to_string();
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(converted),
            config.registry_settings(),
        )?);

        let state = Arc::new(AppState {
            registry: Arc::clone(&registry),
            default_base_url,
            default_api_version: config.default_api_version.clone(),
            keep_alive: config.keep_alive,
        });

        Ok(Self {
            router: bridge::router(state),
            registry,
        })
    }

    /// Serve on `listener` until `shutdown` resolves, then close every session.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails while running.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let stop = CancellationToken::new();
        let reaper = self.registry.spawn_idle_reaper(stop.clone());

        let registry = Arc::clone(&self.registry);
        let stop_on_signal = stop.clone();
        let result = axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                // Open streams never end on their own; close them so the server can drain.
                registry.clear();
                stop_on_signal.cancel();
            })
            .await;

        stop.cancel();
        self.registry.clear();
        if let Some(reaper) = reaper {
            let _ = reaper.await;
        }

        result.map_err(|e| RelayError::Internal(format!("server error: {e}")))
    }
}
