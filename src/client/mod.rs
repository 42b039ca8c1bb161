// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry client.
//!
//! Wires every component together and supervises the background workers:
//! - the connection worker ([`ConnectionManager::run`]): connect, dispatch
//!   pushes, health-check, reconnect
//! - the redo worker ([`RedoService::run`]): replay intents after reconnect
//! - the failover worker ([`FailoverReactor::run`]): poll the failover switch
//!   and data
//! - the config refresh worker ([`ConfigService::run`]): refetch items named
//!   by change pushes
//!
//! All of them share one `watch<bool>` shutdown signal; `shutdown()` flips it and
//! joins their handles with a drain timeout.

mod executor;
mod types;

pub use executor::ClientRedoExecutor;
pub use types::{ClientHealth, ClientState};

use crate::config::ClientConfig;
use crate::config_service::{ConfigChangeNotifyHandler, ConfigService};
use crate::error::{ClientError, Result};
use crate::failover::{DiskFailoverDataSource, FailoverDataSource, FailoverReactor, SnapshotStore};
use crate::lock::LockProxy;
use crate::metrics;
use crate::naming::{NamingGrpcProxy, NotifySubscriberHandler, ServiceInfoHolder};
use crate::redo::RedoService;
use crate::remote::{ConnectionManager, ConnectionSettings, Connector, GrpcConnector};
use crate::security::{Authenticator, HttpAuthenticator, SecurityProxy};
use crate::server_list::ServerListManager;
use crate::transport::{HttpTransport, ResilientTransport};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// How long `shutdown()` waits for each worker.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RegistryClient {
    config: ClientConfig,

    state_tx: watch::Sender<ClientState>,
    state_rx: watch::Receiver<ClientState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    servers: Arc<ServerListManager>,
    security: Arc<SecurityProxy>,
    connection: Arc<ConnectionManager>,
    redo: Arc<RedoService>,
    failover: Arc<FailoverReactor>,
    holder: Arc<ServiceInfoHolder>,
    naming: Arc<NamingGrpcProxy>,
    locks: Arc<LockProxy>,
    configs: Arc<ConfigService>,

    handles: RwLock<Vec<JoinHandle<()>>>,
}

impl RegistryClient {
    /// Client with the gRPC connector and HTTP login.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let http_client = build_http_client(&config)?;
        let connector = Arc::new(GrpcConnector::new(&config.transport));
        let authenticator = Arc::new(HttpAuthenticator::new(http_client.clone(), &config));
        Self::assemble(config, http_client, connector, authenticator)
    }

    /// Client with caller-supplied remoting and login (tests, embedding).
    pub fn with_components(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self> {
        config.validate()?;
        let http_client = build_http_client(&config)?;
        Self::assemble(config, http_client, connector, authenticator)
    }

    fn assemble(
        config: ClientConfig,
        http_client: reqwest::Client,
        connector: Arc<dyn Connector>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self> {
        let servers = Arc::new(ServerListManager::new(config.server_addrs.as_slice())?);
        let security = Arc::new(SecurityProxy::new(&config, Arc::clone(&servers), authenticator));
        let http = Arc::new(HttpTransport::new(
            http_client,
            ResilientTransport::new(
                Arc::clone(&servers),
                Arc::clone(&security),
                config.transport.request_timeout_duration(),
            ),
            &config,
        ));
        let connection = Arc::new(ConnectionManager::new(
            connector,
            Arc::clone(&servers),
            security.is_enabled().then(|| Arc::clone(&security)),
            ConnectionSettings::from_config(&config),
        ));

        let redo = Arc::new(RedoService::new(&config.redo));

        let source: Option<Arc<dyn FailoverDataSource>> = if config.failover.enabled {
            Some(Arc::new(DiskFailoverDataSource::new(
                &config.failover.failover_dir,
                config.tenant_label(),
            )))
        } else {
            None
        };
        let failover = Arc::new(FailoverReactor::new(source, config.failover.refresh_interval_duration()));
        let snapshots = config
            .failover
            .snapshot_enabled
            .then(|| Arc::new(SnapshotStore::new(&config.failover.snapshot_dir, config.tenant_label())));

        let holder = Arc::new(ServiceInfoHolder::new(
            &config.naming,
            snapshots.clone(),
            Arc::clone(&failover),
        ));
        let naming = Arc::new(NamingGrpcProxy::new(
            config.namespace.clone(),
            Arc::clone(&connection),
            Arc::clone(&http),
            Arc::clone(&redo),
            Arc::clone(&holder),
        ));
        let locks = Arc::new(LockProxy::new(Arc::clone(&connection), Arc::clone(&redo)));
        let configs = Arc::new(ConfigService::new(
            config.namespace.clone(),
            Arc::clone(&connection),
            http,
            Arc::clone(&redo),
            Arc::clone(&failover),
            snapshots,
        ));

        let (state_tx, state_rx) = watch::channel(ClientState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            servers,
            security,
            connection,
            redo,
            failover,
            holder,
            naming,
            locks,
            configs,
            handles: RwLock::new(Vec::new()),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // State
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn state(&self) -> ClientState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ClientState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ClientState::Running)
    }

    fn set_state(&self, state: ClientState) {
        let _ = self.state_tx.send(state);
        metrics::set_client_state(&state.to_string());
    }

    /// Collected from cached state only; no network I/O.
    pub async fn health_check(&self) -> ClientHealth {
        let state = self.state();
        let connection = self.connection.state();
        let ready = state == ClientState::Running && self.connection.is_connected();
        let redo_pending = self.redo.instances().find_pending().len()
            + self.redo.subscribers().find_pending().len()
            + self.redo.locks().find_pending().len()
            + self.redo.config_listeners().find_pending().len();
        let servers_healthy = self.servers.healthy_count();

        ClientHealth {
            state,
            connection,
            connection_id: self.connection.connection_id().await,
            ready,
            servers_total: self.servers.len(),
            servers_healthy,
            failover_enabled: self.failover.is_enabled(),
            redo_pending,
            healthy: ready && servers_healthy > 0 && redo_pending == 0,
        }
    }

    /// Wait until the connection worker has a live session.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        self.connection.wait_connected(timeout).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════════

    /// Start the client.
    ///
    /// 1. Loads persisted service snapshots (if configured)
    /// 2. Reads the failover source once
    /// 3. Registers the redo listener and push handlers
    /// 4. Spawns the connection, redo, failover and config refresh workers
    ///
    /// Does not wait for a connection; see [`wait_connected`](Self::wait_connected).
    pub async fn start(&self) -> Result<()> {
        if self.state() != ClientState::Created {
            return Err(ClientError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            servers = self.servers.len(),
            namespace = %self.config.tenant_label(),
            auth = self.security.is_enabled(),
            "Starting registry client"
        );
        self.set_state(ClientState::Starting);

        if let Err(e) = self.prepare().await {
            warn!(error = %e, "Registry client failed to start");
            self.set_state(ClientState::Failed);
            return Err(e);
        }

        self.spawn_workers().await;
        self.set_state(ClientState::Running);
        info!("Registry client running");
        Ok(())
    }

    async fn prepare(&self) -> Result<()> {
        if self.config.naming.load_cache_at_start {
            let loaded = self.holder.load_snapshots().await;
            debug!(loaded, "Service cache warmed from snapshots");
        }

        if self.config.failover.enabled {
            if let Err(e) = self.failover.refresh_once().await {
                warn!(error = %e, "Initial failover refresh failed");
            }
        }

        if self.config.auth.is_enabled() {
            // Fail fast on bad credentials; other login errors are retried later.
            match self.security.get_access_token().await {
                Ok(_) => {}
                Err(ClientError::AuthDenied(message)) => return Err(ClientError::AuthDenied(message)),
                Err(e) => warn!(error = %e, "Initial login failed, will retry on demand"),
            }
        }

        self.connection.add_listener(self.redo.clone()).await;
        self.connection
            .add_handler(Arc::new(NotifySubscriberHandler::new(Arc::clone(&self.holder))))
            .await;
        self.connection
            .add_handler(Arc::new(ConfigChangeNotifyHandler::new(&self.configs)))
            .await;
        Ok(())
    }

    async fn spawn_workers(&self) {
        let mut handles = self.handles.write().await;

        let connection = Arc::clone(&self.connection);
        let shutdown_rx = self.shutdown_rx.clone();
        handles.push(tokio::spawn(
            connection
                .run(shutdown_rx)
                .instrument(tracing::info_span!("connection")),
        ));

        if self.config.redo.enabled {
            let executor = Arc::new(ClientRedoExecutor::new(
                Arc::clone(&self.naming),
                Arc::clone(&self.locks),
                Arc::clone(&self.configs),
            ));
            let redo = Arc::clone(&self.redo);
            let shutdown_rx = self.shutdown_rx.clone();
            handles.push(tokio::spawn(redo.run(executor, shutdown_rx)));
        } else {
            info!("Redo disabled");
        }

        if self.config.failover.enabled {
            let failover = Arc::clone(&self.failover);
            let shutdown_rx = self.shutdown_rx.clone();
            handles.push(tokio::spawn(failover.run(shutdown_rx)));
        }

        let configs = Arc::clone(&self.configs);
        let shutdown_rx = self.shutdown_rx.clone();
        handles.push(tokio::spawn(configs.run(shutdown_rx)));

        info!(workers = handles.len(), "Spawned client workers");
    }

    /// Stop every worker and close the connection.
    ///
    /// Shutdown sequence:
    /// 1. Signal all workers to stop
    /// 2. Wait for them to finish their current unit of work (concurrently, with timeout)
    /// 3. Close the connection
    pub async fn shutdown(&self) {
        if matches!(self.state(), ClientState::Stopped | ClientState::ShuttingDown) {
            return;
        }
        info!("Shutting down registry client");
        self.set_state(ClientState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };
        if !handles.is_empty() {
            info!(workers = handles.len(), "Waiting for workers to finish");
        }
        let results = join_all(
            handles
                .into_iter()
                .map(|handle| tokio::time::timeout(DRAIN_TIMEOUT, handle)),
        )
        .await;
        for (i, result) in results.into_iter().enumerate() {
            match result {
                Ok(Ok(())) => debug!(worker = i + 1, "Worker finished"),
                Ok(Err(e)) => warn!(worker = i + 1, error = %e, "Worker panicked during shutdown"),
                Err(_) => warn!(worker = i + 1, "Worker timed out during shutdown"),
            }
        }

        self.connection.shutdown().await;
        self.set_state(ClientState::Stopped);
        info!("Registry client stopped");
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Components
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn naming(&self) -> &Arc<NamingGrpcProxy> {
        &self.naming
    }

    pub fn locks(&self) -> &Arc<LockProxy> {
        &self.locks
    }

    pub fn configs(&self) -> &Arc<ConfigService> {
        &self.configs
    }

    pub fn service_info(&self) -> &Arc<ServiceInfoHolder> {
        &self.holder
    }

    pub fn redo(&self) -> &Arc<RedoService> {
        &self.redo
    }

    pub fn failover(&self) -> &Arc<FailoverReactor> {
        &self.failover
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn servers(&self) -> &Arc<ServerListManager> {
        &self.servers
    }
}

fn build_http_client(config: &ClientConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(config.transport.connect_timeout_duration())
        .build()
        .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {}", e)))
}
