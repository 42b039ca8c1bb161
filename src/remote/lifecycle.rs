// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection lifecycle: handshake, push dispatch, keepalive, reconnect.
//!
//! # State Machine
//!
//! ```text
//!                  connect_once() ok
//!  Disconnected ──► Connecting ──────────► Connected
//!       ▲               │                      │
//!       │  every server │                      │ stream closed
//!       └───── failed ◄─┘                      │ health check failed
//!       └──────────────────────────────────────┘ ConnectResetRequest
//!
//!  any state ──shutdown()──► Shutdown (terminal)
//! ```
//!
//! Entering `Connected` notifies every [`ConnectionEventListener`] in
//! registration order; leaving it notifies them again with
//! `on_disconnected`. A listener error is logged and does not stop the others.
//!
//! # Push Dispatch
//!
//! `SetupAckRequest`, `ClientDetectionRequest` and `ConnectResetRequest` are
//! handled here. Anything else is offered to the registered
//! [`ServerRequestHandler`]s in order until one answers. Every push whose
//! type ends in `Request` gets exactly one `...Response` on the stream: the
//! handler's answer, or a default success ack.

use super::connection::{Connector, RpcConnection};
use super::messages::{
    ConnectResetRequest, ConnectionSetupRequest, HealthCheckRequest, SetupAckRequest, CLIENT_DETECTION_REQUEST,
};
use super::payload::{
    decode, decode_response, encode, encode_as, next_request_id, response_type_for, EmptyBody, Payload,
    RemoteMessage, ResponseStatus,
};
use crate::error::{BoxFuture, ClientError, Result};
use crate::metrics;
use crate::resilience::RetryConfig;
use crate::security::{SecurityProxy, ACCESS_TOKEN_HEADER};
use crate::server_list::{ServerEndpoint, ServerListManager};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// Connection state, published through a `watch` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal.
    Shutdown,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Notified when the connection comes up or goes down.
pub trait ConnectionEventListener: Send + Sync {
    fn on_connected(&self) -> Result<()>;
    fn on_disconnected(&self) -> Result<()>;
}

/// Handles a server push.
///
/// Return `Ok(Some(response))` to answer it, `Ok(None)` to let the next
/// handler (or the default ack) take it.
pub trait ServerRequestHandler: Send + Sync {
    fn handle<'a>(&'a self, request: &'a Payload) -> BoxFuture<'a, Option<Payload>>;
}

/// Handshake parameters and timings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub client_version: String,
    pub tenant: String,
    pub labels: BTreeMap<String, String>,
    pub request_timeout: Duration,
    pub setup_timeout: Duration,
    pub health_check_interval: Duration,
    pub reconnect: RetryConfig,
}

impl ConnectionSettings {
    pub fn from_config(config: &crate::config::ClientConfig) -> Self {
        Self {
            client_version: config.transport.client_version.clone(),
            tenant: config.namespace.clone(),
            labels: config.transport.labels.clone(),
            request_timeout: config.transport.request_timeout_duration(),
            setup_timeout: config.transport.setup_timeout_duration(),
            health_check_interval: config.transport.health_check_interval_duration(),
            reconnect: RetryConfig::reconnect(),
        }
    }
}

/// Result of dispatching one push.
#[derive(Debug, PartialEq, Eq)]
enum PushOutcome {
    Continue,
    Reset(Option<String>),
}

/// Why a connected session ended.
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Lost(String),
    Reset(Option<String>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestIdOnly {
    #[serde(default)]
    request_id: Option<String>,
}

/// Owns the single server connection.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    servers: Arc<ServerListManager>,
    security: Option<Arc<SecurityProxy>>,
    settings: ConnectionSettings,
    state_tx: watch::Sender<ConnectionState>,
    current: RwLock<Option<Arc<dyn RpcConnection>>>,
    abilities: RwLock<BTreeMap<String, bool>>,
    listeners: RwLock<Vec<Arc<dyn ConnectionEventListener>>>,
    handlers: RwLock<Vec<Arc<dyn ServerRequestHandler>>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        servers: Arc<ServerListManager>,
        security: Option<Arc<SecurityProxy>>,
        settings: ConnectionSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            servers,
            security,
            settings,
            state_tx,
            current: RwLock::new(None),
            abilities: RwLock::new(BTreeMap::new()),
            listeners: RwLock::new(Vec::new()),
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Move to `next` unless already shut down. Returns whether it changed.
    fn transition(&self, next: ConnectionState) -> bool {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Shutdown || *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            metrics::set_connection_state(&next.to_string());
        }
        changed
    }

    pub async fn add_listener(&self, listener: Arc<dyn ConnectionEventListener>) {
        self.listeners.write().await.push(listener);
    }

    pub async fn add_handler(&self, handler: Arc<dyn ServerRequestHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Wait until connected, up to `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        let connected = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| *s == ConnectionState::Connected)).await,
            Ok(Ok(_))
        );
        connected
    }

    /// Ability table announced by the server in `SetupAckRequest`.
    pub async fn server_abilities(&self) -> BTreeMap<String, bool> {
        self.abilities.read().await.clone()
    }

    pub async fn connection_id(&self) -> Option<String> {
        self.current.read().await.as_ref().map(|c| c.connection_id().to_string())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Connecting
    // ═══════════════════════════════════════════════════════════════════════════

    /// Try every server once (round-robin), stopping at the first that
    /// completes the handshake.
    pub async fn connect_once(&self) -> Result<()> {
        self.connect_preferring(None).await
    }

    async fn connect_preferring(&self, preferred: Option<String>) -> Result<()> {
        if self.state() == ConnectionState::Shutdown {
            return Err(ClientError::Shutdown);
        }
        self.transition(ConnectionState::Connecting);

        let mut preferred = preferred.as_deref().and_then(|addr| self.servers.find(addr));
        let attempts = self.servers.len() + usize::from(preferred.is_some());

        let mut last_error = None;
        for _ in 0..attempts {
            // Picked lazily so servers that just failed drop out of the rotation.
            let server = preferred.take().unwrap_or_else(|| self.servers.get_next_server());
            match self.handshake(&server).await {
                Ok(connection) => {
                    metrics::record_connection_attempt(server.address(), true);
                    server.mark_healthy();
                    info!(
                        server = %server.address(),
                        connection_id = %connection.connection_id(),
                        "Connected"
                    );
                    *self.current.write().await = Some(connection);
                    if !self.transition(ConnectionState::Connected) {
                        // Shut down while we were connecting.
                        self.close_current().await;
                        return Err(ClientError::Shutdown);
                    }
                    self.notify_connected().await;
                    return Ok(());
                }
                Err(e) => {
                    metrics::record_connection_attempt(server.address(), false);
                    server.mark_unhealthy();
                    warn!(server = %server.address(), error = %e, "Connection attempt failed, trying next server");
                    last_error = Some(e);
                }
            }
        }

        self.transition(ConnectionState::Disconnected);
        let cause = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no server configured".to_string());
        Err(ClientError::Disconnected(format!("no server accepted the connection: {}", cause)))
    }

    /// Transport connect, setup message, optional ability negotiation.
    async fn handshake(&self, server: &ServerEndpoint) -> Result<Arc<dyn RpcConnection>> {
        let (connection, check) = self.connector.connect(server).await?;

        let setup = ConnectionSetupRequest::new(
            &self.settings.client_version,
            &self.settings.tenant,
            self.settings.labels.clone(),
        );
        if let Err(e) = connection.send(encode(&setup, "")?).await {
            connection.close();
            return Err(e);
        }

        self.abilities.write().await.clear();
        if check.support_ability_negotiation {
            match tokio::time::timeout(self.settings.setup_timeout, self.wait_setup_ack(&connection)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    connection.close();
                    return Err(e);
                }
                Err(_) => {
                    warn!(
                        server = %server.address(),
                        timeout_ms = self.settings.setup_timeout.as_millis() as u64,
                        "No ability table from server, continuing without it"
                    );
                }
            }
        }
        Ok(connection)
    }

    async fn wait_setup_ack(&self, connection: &Arc<dyn RpcConnection>) -> Result<()> {
        loop {
            let Some(push) = connection.next_push().await? else {
                return Err(ClientError::transient(
                    connection.server(),
                    "stream closed during setup",
                ));
            };
            let is_ack = push.message_type() == SetupAckRequest::TYPE;
            self.dispatch_push(connection, push).await;
            if is_ack {
                return Ok(());
            }
        }
    }

    async fn notify_connected(&self) {
        let listeners = self.listeners.read().await.clone();
        for listener in listeners {
            if let Err(e) = listener.on_connected() {
                error!(error = %e, "Connection listener failed on connect");
            }
        }
    }

    async fn notify_disconnected(&self) {
        let listeners = self.listeners.read().await.clone();
        for listener in listeners {
            if let Err(e) = listener.on_disconnected() {
                error!(error = %e, "Connection listener failed on disconnect");
            }
        }
    }

    async fn close_current(&self) {
        if let Some(connection) = self.current.write().await.take() {
            connection.close();
        }
    }

    /// Drop the current connection and notify listeners.
    async fn handle_disconnect(&self, reason: &str) {
        let previous = self.current.write().await.take();
        if let Some(connection) = &previous {
            connection.close();
            info!(
                server = %connection.server(),
                connection_id = %connection.connection_id(),
                reason,
                "Disconnected"
            );
        }
        if self.transition(ConnectionState::Disconnected) {
            self.notify_disconnected().await;
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Requests
    // ═══════════════════════════════════════════════════════════════════════════

    /// Unary request on the current connection.
    ///
    /// Fails with [`ClientError::Disconnected`] when not connected, and with
    /// [`ClientError::Shutdown`] once the manager is shut down.
    pub async fn request(&self, mut payload: Payload) -> Result<Payload> {
        let connection = match (self.state(), self.current.read().await.clone()) {
            (ConnectionState::Connected, Some(connection)) => connection,
            (ConnectionState::Shutdown, _) => return Err(ClientError::Shutdown),
            (state, _) => {
                return Err(ClientError::Disconnected(format!("connection is {}", state)));
            }
        };

        if let Some(security) = &self.security {
            if let Some(token) = security.get_access_token().await? {
                if let Some(metadata) = payload.metadata.as_mut() {
                    metadata.headers.insert(ACCESS_TOKEN_HEADER.to_string(), token);
                }
            }
        }

        connection.request(payload, self.settings.request_timeout).await
    }

    /// Encode, send, and decode a typed request.
    pub async fn request_typed<Req, Resp>(&self, request: &Req) -> Result<Resp>
    where
        Req: RemoteMessage,
        Resp: DeserializeOwned,
    {
        let payload = encode(request, "")?;
        let answer = self.request(payload).await?;
        let server = self
            .current
            .read()
            .await
            .as_ref()
            .map(|c| c.server().to_string())
            .unwrap_or_default();
        decode_response(&answer, &server)
    }

    async fn health_check(&self, connection: &Arc<dyn RpcConnection>) -> Result<()> {
        let request = HealthCheckRequest {
            request_id: next_request_id(),
            ..Default::default()
        };
        let answer = connection
            .request(encode(&request, "")?, self.settings.request_timeout)
            .await?;
        decode_response::<EmptyBody>(&answer, connection.server()).map(|_| ())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Push dispatch
    // ═══════════════════════════════════════════════════════════════════════════

    async fn dispatch_push(&self, connection: &Arc<dyn RpcConnection>, push: Payload) -> PushOutcome {
        let push_type = push.message_type().to_string();
        metrics::record_push(&push_type);
        debug!(push_type = %push_type, server = %connection.server(), "Server push received");

        let mut outcome = PushOutcome::Continue;
        let mut response: Option<Payload> = None;

        if push_type == SetupAckRequest::TYPE {
            match decode::<SetupAckRequest>(&push) {
                Ok(ack) => {
                    debug!(abilities = ack.ability_table.len(), "Server ability table received");
                    *self.abilities.write().await = ack.ability_table;
                }
                Err(e) => warn!(error = %e, "Malformed SetupAckRequest"),
            }
        } else if push_type == CLIENT_DETECTION_REQUEST {
            // Answered by the default ack.
        } else if push_type == ConnectResetRequest::TYPE {
            let target = decode::<ConnectResetRequest>(&push).ok().and_then(|r| r.target());
            info!(server = %connection.server(), target = ?target, "Server requested reconnect");
            outcome = PushOutcome::Reset(target);
        } else {
            let handlers = self.handlers.read().await.clone();
            for handler in handlers {
                match handler.handle(&push).await {
                    Ok(Some(answer)) => {
                        response = Some(answer);
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(push_type = %push_type, error = %e, "Push handler failed"),
                }
            }
        }

        if push.is_request() {
            let answer = match response {
                Some(answer) => Ok(answer),
                None => default_ack(&push),
            };
            match answer {
                Ok(answer) => {
                    if let Err(e) = connection.send(answer).await {
                        warn!(push_type = %push_type, error = %e, "Failed to acknowledge push");
                    }
                }
                Err(e) => warn!(push_type = %push_type, error = %e, "Failed to build push ack"),
            }
        }
        outcome
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Worker
    // ═══════════════════════════════════════════════════════════════════════════

    /// Keep a connection alive until shutdown.
    ///
    /// Reconnects with exponential backoff whenever the session ends.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut attempt = 0usize;
        let mut preferred: Option<String> = None;

        loop {
            if *shutdown_rx.borrow() || self.state() == ConnectionState::Shutdown {
                break;
            }

            if !self.is_connected() {
                match self.connect_preferring(preferred.take()).await {
                    Ok(()) => attempt = 0,
                    Err(ClientError::Shutdown) => break,
                    Err(e) => {
                        attempt += 1;
                        let delay = self.settings.reconnect.delay_for_attempt(attempt);
                        warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Reconnect failed");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            res = shutdown_rx.changed() => {
                                if res.is_err() || *shutdown_rx.borrow() {
                                    break;
                                }
                            }
                        }
                        continue;
                    }
                }
            }

            match self.run_session(&mut shutdown_rx).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(reason) => {
                    if let Some(server) = self.current_server().await {
                        self.servers.mark_failure(&server);
                    }
                    self.handle_disconnect(&reason).await;
                }
                SessionEnd::Reset(target) => {
                    preferred = target;
                    self.handle_disconnect("server requested reset").await;
                }
            }
        }

        self.shutdown().await;
        debug!("Connection worker stopped");
    }

    async fn current_server(&self) -> Option<String> {
        self.current.read().await.as_ref().map(|c| c.server().to_string())
    }

    async fn run_session(&self, shutdown_rx: &mut watch::Receiver<bool>) -> SessionEnd {
        let Some(connection) = self.current.read().await.clone() else {
            return SessionEnd::Lost("no connection".to_string());
        };

        let mut health = tokio::time::interval(self.settings.health_check_interval);
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        health.tick().await;

        loop {
            tokio::select! {
                push = connection.next_push() => match push {
                    Ok(Some(push)) => {
                        if let PushOutcome::Reset(target) = self.dispatch_push(&connection, push).await {
                            return SessionEnd::Reset(target);
                        }
                    }
                    Ok(None) => return SessionEnd::Lost("stream closed".to_string()),
                    Err(e) => return SessionEnd::Lost(e.to_string()),
                },
                _ = health.tick() => {
                    if let Err(e) = self.health_check(&connection).await {
                        warn!(server = %connection.server(), error = %e, "Health check failed");
                        return SessionEnd::Lost(format!("health check failed: {}", e));
                    }
                }
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        return SessionEnd::Shutdown;
                    }
                }
            }
        }
    }

    /// Close the connection and enter the terminal state.
    pub async fn shutdown(&self) {
        self.close_current().await;
        self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Shutdown {
                return false;
            }
            *state = ConnectionState::Shutdown;
            true
        });
        metrics::set_connection_state("Shutdown");
    }
}

/// Success answer to a push, echoing its request id.
fn default_ack(push: &Payload) -> Result<Payload> {
    let request_id = decode::<RequestIdOnly>(push).ok().and_then(|r| r.request_id);
    encode_as(&response_type_for(push.message_type()), &ResponseStatus::success(request_id), "")
}
