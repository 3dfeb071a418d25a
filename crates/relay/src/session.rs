//! Session registry: the single authority correlating inbound messages with open streams.
//!
//! Each session owns its connection config, a [`ToolProxy`] bound to it, and one transport.
//! A per-session worker task processes inbound messages sequentially; a watcher task removes
//! the session as soon as its transport closes.

use crate::dispatch::dispatch;
use crate::error::{RelayError, Result};
use crate::jsonrpc::JsonRpcMessage;
use crate::transport::{InboundReceiver, OutboundStream, SseTransport, Transport, TransportSettings};
use chrono::{DateTime, Utc};
use mcp_relay_openapi_tools::config::{ConnectionConfig, ExecutorSettings};
use mcp_relay_openapi_tools::converter::ConvertedSpec;
use mcp_relay_openapi_tools::executor::RequestExecutor;
use mcp_relay_openapi_tools::proxy::ToolProxy;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

/// Settings shared by every session the registry opens.
#[derive(Debug, Clone, Default)]
pub struct RegistrySettings {
    pub executor: ExecutorSettings,
    pub transport: TransportSettings,
    /// Close sessions with no inbound traffic for this long. `None` disables the reaper.
    pub idle_timeout: Option<Duration>,
}

pub struct Session {
    id: String,
    connection: ConnectionConfig,
    transport: Arc<dyn Transport>,
    created_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
}

impl Session {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionConfig {
        &self.connection
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Queue one inbound message for this session's worker.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if the transport has already closed: a closed session no longer
    /// exists as far as clients are concerned.
    pub async fn deliver(&self, message: JsonRpcMessage) -> Result<()> {
        *self.last_activity.lock() = Utc::now();
        self.transport
            .deliver(message)
            .await
            .map_err(|e| match e {
                RelayError::SessionClosed(id) => RelayError::SessionNotFound(id),
                other => other,
            })
    }

    pub fn close(&self) {
        self.transport.close();
    }
}

/// A freshly opened session plus the stream the HTTP layer must serve.
pub struct OpenedSession {
    pub session: Arc<Session>,
    pub outbound: OutboundStream,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    spec: Arc<ConvertedSpec>,
    settings: RegistrySettings,
    http: reqwest::Client,
}

impl SessionRegistry {
    /// Create an empty registry serving `spec`.
    ///
    /// # Errors
    ///
    /// Returns an error if the shared HTTP client cannot be constructed.
    pub fn new(spec: Arc<ConvertedSpec>, settings: RegistrySettings) -> Result<Self> {
        let http = settings
            .executor
            .safety
            .build_client()
            .map_err(|e| RelayError::Startup(e.to_string()))?;
        Ok(Self {
            sessions: RwLock::new(HashMap::new()),
            spec,
            settings,
            http,
        })
    }

    #[must_use]
    pub fn spec(&self) -> &Arc<ConvertedSpec> {
        &self.spec
    }

    /// Validate `connection` and register a new session for it.
    ///
    /// Nothing is registered when validation fails.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the base URL is rejected by the outbound safety policy.
    pub async fn open(self: &Arc<Self>, connection: ConnectionConfig) -> Result<OpenedSession> {
        let base = Url::parse(&connection.base_url).map_err(|e| {
            RelayError::Config(format!("Invalid baseUrl '{}': {e}", connection.base_url))
        })?;
        self.settings
            .executor
            .safety
            .check_url(&base)
            .await
            .map_err(|e| RelayError::Config(e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let endpoint = format!("/message?sessionId={id}");
        let (transport, outbound, inbound) =
            SseTransport::open(&id, endpoint, &self.settings.transport);
        let transport: Arc<dyn Transport> = Arc::new(transport);

        let executor = RequestExecutor::with_client(
            connection.clone(),
            self.settings.executor.clone(),
            self.http.clone(),
        );
        let proxy = ToolProxy::new(Arc::clone(&self.spec), executor);

        let now = Utc::now();
        let session = Arc::new(Session {
            id: id.clone(),
            connection,
            transport,
            created_at: now,
            last_activity: Mutex::new(now),
        });

        self.sessions.write().insert(id.clone(), Arc::clone(&session));
        tokio::spawn(run_worker(Arc::clone(&session), proxy, inbound));
        tokio::spawn(watch_close(Arc::downgrade(self), Arc::clone(&session)));

        tracing::info!(
            session_id = %id,
            base_url = %session.connection.base_url,
            "session opened"
        );
        Ok(OpenedSession { session, outbound })
    }

    /// Look up an open session. A closed entry still awaiting its watcher is dropped here.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.read().get(id).cloned()?;
        if session.is_closed() {
            self.remove(id);
            return None;
        }
        Some(session)
    }

    /// Find the session an inbound message belongs to.
    ///
    /// With no explicit id the message is routed implicitly only when exactly one session is open.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` for an unknown or closed explicit id, `SessionRequired` when no id was
    /// given and the implicit fallback does not apply.
    pub fn resolve(&self, explicit: Option<&str>) -> Result<Arc<Session>> {
        if let Some(id) = explicit {
            return self
                .get(id)
                .ok_or_else(|| RelayError::SessionNotFound(id.to_string()));
        }

        let open: Vec<Arc<Session>> = self
            .sessions
            .read()
            .values()
            .filter(|s| !s.is_closed())
            .take(2)
            .cloned()
            .collect();
        match open.as_slice() {
            [only] => Ok(Arc::clone(only)),
            [] => Err(RelayError::SessionRequired(
                "no session id given and no session is open".to_string(),
            )),
            _ => Err(RelayError::SessionRequired(
                "no session id given and more than one session is open".to_string(),
            )),
        }
    }

    /// Remove a session from the table without touching its transport.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(id);
        if removed.is_some() {
            tracing::info!(session_id = %id, "session closed");
        }
        removed
    }

    /// Close and unregister a session. Returns false if it was not registered.
    pub fn close(&self, id: &str) -> bool {
        match self.remove(id) {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Close every session.
    pub fn clear(&self) {
        let drained: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "closing all sessions");
        }
        for session in drained {
            session.close();
        }
    }

    /// Close sessions idle longer than `now - idle_timeout`. Returns how many were closed.
    pub fn reap_idle(&self, now: DateTime<Utc>) -> usize {
        let Some(timeout) = self.settings.idle_timeout else {
            return 0;
        };
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return 0;
        };

        let idle: Vec<String> = self
            .sessions
            .read()
            .values()
            .filter(|s| now - s.last_activity() > timeout)
            .map(|s| s.id.clone())
            .collect();

        for id in &idle {
            tracing::info!(session_id = %id, "closing idle session");
            self.close(id);
        }
        idle.len()
    }

    /// Run the idle reaper until `shutdown` fires. `None` when no idle timeout is configured.
    pub fn spawn_idle_reaper(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let timeout = self.settings.idle_timeout?;
        let period = (timeout / 2).max(Duration::from_secs(1));
        let registry = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(registry) = registry.upgrade() else { break };
                        registry.reap_idle(Utc::now());
                    }
                }
            }
        }))
    }
}

async fn run_worker(session: Arc<Session>, proxy: ToolProxy, mut inbound: InboundReceiver) {
    loop {
        let message = tokio::select! {
            () = session.transport.closed() => break,
            message = inbound.recv() => match message {
                Some(m) => m,
                None => break,
            },
        };

        // The upstream call runs to completion even if the client goes away meanwhile.
        let Some(reply) = dispatch(&proxy, message).await else {
            continue;
        };
        if session.transport.is_closed() {
            tracing::debug!(session_id = %session.id, "discarding result for closed session");
            break;
        }
        if let Err(e) = session.transport.send(reply).await {
            tracing::debug!(session_id = %session.id, error = %e, "failed to push result");
            break;
        }
    }
    tracing::debug!(session_id = %session.id, "session worker stopped");
}

async fn watch_close(registry: Weak<SessionRegistry>, session: Arc<Session>) {
    session.transport.closed().await;
    if let Some(registry) = registry.upgrade() {
        registry.remove(&session.id);
    }
}
