// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration facade.
//!
//! # Read Path
//!
//! ```text
//! get_config(data_id, group):
//!     failover switch on and item present  -> failover copy
//!     else GET /v1/cs/configs              -> server copy (persisted as snapshot)
//!          404                             -> None (snapshot removed)
//!          connectivity failure            -> local snapshot, else the error
//!     filter chain (Get phase)             -> returned content
//! ```
//!
//! # Listening
//!
//! The first listener for an item records a listen intent in the redo engine
//! and sends `ConfigBatchListenRequest`. `ConfigChangeNotifyRequest` pushes,
//! and items reported as changed by a listen call, trigger a refetch; the
//! listeners are called only when the content checksum actually moved.
//! Push-triggered refetches are queued for the refresh worker
//! ([`ConfigService::run`]) so the push loop never waits on the network.

pub mod filter;
pub mod messages;
mod model;

pub use filter::{ConfigFilter, ConfigFilterChain, ConfigParser, ConfigPhase, JsonParser, PropertiesParser};
pub use model::{content_checksum, ConfigSnapshot, DEFAULT_CONFIG_GROUP};

use crate::error::{BoxFuture, ClientError, Result};
use crate::failover::{FailoverEntry, FailoverKind, FailoverReactor, SnapshotStore};
use crate::redo::{config_key, ConfigListenRedo, RedoService};
use crate::remote::payload::{decode, encode_as, next_request_id, response_type_for, ResponseStatus};
use crate::remote::{ConnectionManager, Payload, RemoteMessage, ServerRequestHandler};
use crate::transport::HttpTransport;
use dashmap::DashMap;
use messages::{ConfigBatchListenRequest, ConfigChangeBatchListenBody, ConfigChangeNotifyRequest, ConfigListenContext};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn, Instrument};

const CONFIG_PATH: &str = "/v1/cs/configs";

/// Content of a listened item changed. `None` means absent on the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigChangeEvent {
    pub data_id: String,
    pub group: String,
    pub tenant: String,
    pub old_content: Option<String>,
    pub new_content: Option<String>,
}

pub trait ConfigChangeListener: Send + Sync {
    fn on_change(&self, event: &ConfigChangeEvent);
}

pub struct ConfigService {
    tenant: String,
    connection: Arc<ConnectionManager>,
    http: Arc<HttpTransport>,
    redo: Arc<RedoService>,
    failover: Arc<FailoverReactor>,
    snapshots: Option<Arc<SnapshotStore>>,
    filters: RwLock<ConfigFilterChain>,
    /// Last raw (unfiltered) content per listened item.
    cache: DashMap<String, ConfigSnapshot>,
    listeners: DashMap<String, Vec<Arc<dyn ConfigChangeListener>>>,
    /// (data id, group) pairs waiting for the refresh worker.
    refresh_tx: mpsc::UnboundedSender<(String, String)>,
    refresh_rx: Mutex<Option<mpsc::UnboundedReceiver<(String, String)>>>,
}

impl ConfigService {
    pub fn new(
        tenant: impl Into<String>,
        connection: Arc<ConnectionManager>,
        http: Arc<HttpTransport>,
        redo: Arc<RedoService>,
        failover: Arc<FailoverReactor>,
        snapshots: Option<Arc<SnapshotStore>>,
    ) -> Self {
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        Self {
            tenant: tenant.into(),
            connection,
            http,
            redo,
            failover,
            snapshots,
            filters: RwLock::new(ConfigFilterChain::new()),
            cache: DashMap::new(),
            listeners: DashMap::new(),
            refresh_tx,
            refresh_rx: Mutex::new(Some(refresh_rx)),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub async fn add_filter(&self, filter: Arc<dyn ConfigFilter>) {
        self.filters.write().await.add(filter);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Read / write
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn get_config(&self, data_id: &str, group: &str) -> Result<Option<String>> {
        Ok(self.get_config_snapshot(data_id, group).await?.map(|c| c.content))
    }

    /// Like [`get_config`](Self::get_config), keeping type and checksum.
    pub async fn get_config_snapshot(&self, data_id: &str, group: &str) -> Result<Option<ConfigSnapshot>> {
        validate(data_id, group)?;
        let key = config_key(data_id, group, &self.tenant);

        let raw = match self.failover_copy(&key) {
            Some(copy) => {
                debug!(key = %key, "Config served from failover data");
                Some(copy)
            }
            None => match self.fetch(data_id, group).await {
                Ok(found) => found,
                Err(e) if e.is_connectivity() => match self.local_snapshot(&key).await {
                    Some(snapshot) => {
                        warn!(key = %key, error = %e, "Server unreachable, serving local snapshot");
                        Some(snapshot)
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            },
        };

        match raw {
            Some(mut config) => {
                self.filters.read().await.apply(ConfigPhase::Get, &mut config)?;
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }

    /// Parse the item into a flat map. An absent item yields an empty map.
    pub async fn get_config_as_map(
        &self,
        data_id: &str,
        group: &str,
        parser: &dyn ConfigParser,
    ) -> Result<BTreeMap<String, String>> {
        match self.get_config(data_id, group).await? {
            Some(content) => parser.parse(&content),
            None => Ok(BTreeMap::new()),
        }
    }

    pub async fn publish_config(
        &self,
        data_id: &str,
        group: &str,
        content: &str,
        content_type: Option<&str>,
    ) -> Result<bool> {
        validate(data_id, group)?;
        if content.trim().is_empty() {
            return Err(ClientError::InvalidInput("config content must not be empty".to_string()));
        }
        let mut config = ConfigSnapshot::new(data_id, group, &self.tenant, content);
        config.content_type = content_type.map(str::to_string);
        self.filters.read().await.apply(ConfigPhase::Publish, &mut config)?;

        let mut params = self.item_params(data_id, group);
        params.push(("content", config.content.clone()));
        if let Some(kind) = &config.content_type {
            params.push(("type", kind.clone()));
        }
        if let Some(data_key) = &config.encrypted_data_key {
            params.push(("encryptedDataKey", data_key.clone()));
        }
        let answer = self.http.post_form("publish_config", CONFIG_PATH, &params).await?;
        let published = is_true(&answer);
        info!(key = %config.key(), published, "Config published");
        Ok(published)
    }

    pub async fn remove_config(&self, data_id: &str, group: &str) -> Result<bool> {
        validate(data_id, group)?;
        let params = self.item_params(data_id, group);
        let answer = self.http.delete("remove_config", CONFIG_PATH, &params).await?;
        let removed = is_true(&answer);
        info!(key = %config_key(data_id, group, &self.tenant), removed, "Config removed");
        Ok(removed)
    }

    fn item_params(&self, data_id: &str, group: &str) -> Vec<(&'static str, String)> {
        let mut params = vec![("dataId", data_id.to_string()), ("group", group.to_string())];
        if !self.tenant.is_empty() {
            params.push(("tenant", self.tenant.clone()));
        }
        params
    }

    fn failover_copy(&self, key: &str) -> Option<ConfigSnapshot> {
        self.failover
            .get_data(FailoverKind::Config, key)
            .and_then(|entry| entry.as_config().cloned())
    }

    async fn local_snapshot(&self, key: &str) -> Option<ConfigSnapshot> {
        let store = self.snapshots.as_ref()?;
        store
            .read(FailoverKind::Config, key)
            .await
            .and_then(|entry| entry.as_config().cloned())
    }

    /// Server copy, unfiltered. Keeps the local snapshot in step.
    async fn fetch(&self, data_id: &str, group: &str) -> Result<Option<ConfigSnapshot>> {
        let params = self.item_params(data_id, group);
        match self.http.get("get_config", CONFIG_PATH, &params).await {
            Ok(content) => {
                let config = ConfigSnapshot::new(data_id, group, &self.tenant, content);
                if let Some(store) = &self.snapshots {
                    if let Err(e) = store.write(&FailoverEntry::config(config.clone())).await {
                        warn!(key = %config.key(), error = %e, "Failed to persist config snapshot");
                    }
                }
                Ok(Some(config))
            }
            Err(ClientError::NotFound(_)) => {
                if let Some(store) = &self.snapshots {
                    let key = config_key(data_id, group, &self.tenant);
                    if let Err(e) = store.remove(FailoverKind::Config, &key).await {
                        warn!(key = %key, error = %e, "Failed to remove config snapshot");
                    }
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Listening
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn add_listener(
        &self,
        data_id: &str,
        group: &str,
        listener: Arc<dyn ConfigChangeListener>,
    ) -> Result<()> {
        validate(data_id, group)?;
        let key = config_key(data_id, group, &self.tenant);
        let first = {
            let mut entry = self.listeners.entry(key.clone()).or_default();
            entry.push(listener);
            entry.len() == 1
        };
        if !first {
            return Ok(());
        }

        // Seed the cache so the first change is compared against real content.
        match self.fetch(data_id, group).await {
            Ok(Some(config)) => {
                self.cache.insert(key.clone(), config);
            }
            Ok(None) => {}
            Err(e) => debug!(key = %key, error = %e, "Could not seed config cache"),
        }

        let data = ConfigListenRedo {
            data_id: data_id.to_string(),
            group: group.to_string(),
            tenant: self.tenant.clone(),
        };
        self.redo.config_listeners().cache_for_redo(&key, data.clone());
        match self.do_listen(&data).await {
            Ok(()) => {
                self.redo.config_listeners().mark_registered(&key);
                info!(key = %key, "Listening for config changes");
                Ok(())
            }
            Err(ClientError::InvalidInput(message)) => {
                self.redo.config_listeners().remove(&key);
                Err(ClientError::InvalidInput(message))
            }
            Err(e) if e.is_connectivity() => {
                warn!(key = %key, error = %e, "Config listen deferred to redo");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn remove_listener(
        &self,
        data_id: &str,
        group: &str,
        listener: &Arc<dyn ConfigChangeListener>,
    ) -> Result<()> {
        validate(data_id, group)?;
        let key = config_key(data_id, group, &self.tenant);
        let emptied = match self.listeners.get_mut(&key) {
            Some(mut registered) => {
                registered.retain(|l| !Arc::ptr_eq(l, listener));
                registered.is_empty()
            }
            None => return Ok(()),
        };
        if !emptied {
            return Ok(());
        }
        self.listeners.remove_if(&key, |_, registered| registered.is_empty());
        self.cache.remove(&key);

        let Some(entry) = self.redo.config_listeners().get(&key) else {
            return Ok(());
        };
        let confirmed = entry.registered;
        self.redo.config_listeners().mark_unregistering(&key);
        match self.do_unlisten(&entry.data).await {
            Ok(()) => {
                self.redo.config_listeners().mark_unregistered(&key);
                self.redo.config_listeners().remove_if_unwound(&key);
                info!(key = %key, "Stopped listening for config changes");
                Ok(())
            }
            Err(e) if e.is_connectivity() => {
                if confirmed {
                    warn!(key = %key, error = %e, "Config unlisten deferred to redo");
                } else {
                    self.redo.config_listeners().mark_unregistered(&key);
                    self.redo.config_listeners().remove_if_unwound(&key);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn listener_count(&self, data_id: &str, group: &str) -> usize {
        self.listeners
            .get(&config_key(data_id, group, &self.tenant))
            .map(|l| l.len())
            .unwrap_or(0)
    }

    pub(crate) async fn do_listen(&self, data: &ConfigListenRedo) -> Result<()> {
        let key = data.key();
        let checksum = self.cache.get(&key).map(|c| c.checksum.clone()).unwrap_or_default();
        let request = ConfigBatchListenRequest {
            request_id: next_request_id(),
            listen: true,
            config_listen_contexts: vec![ConfigListenContext {
                data_id: data.data_id.clone(),
                group: data.group.clone(),
                tenant: data.tenant.clone(),
                md5: checksum,
            }],
        };
        let body: ConfigChangeBatchListenBody = self.connection.request_typed(&request).await?;
        for changed in body.changed_configs {
            if let Err(e) = self.refresh(&changed.data_id, &changed.group).await {
                warn!(data_id = %changed.data_id, group = %changed.group, error = %e, "Config refresh failed");
            }
        }
        Ok(())
    }

    pub(crate) async fn do_unlisten(&self, data: &ConfigListenRedo) -> Result<()> {
        let request = ConfigBatchListenRequest {
            request_id: next_request_id(),
            listen: false,
            config_listen_contexts: vec![ConfigListenContext {
                data_id: data.data_id.clone(),
                group: data.group.clone(),
                tenant: data.tenant.clone(),
                md5: String::new(),
            }],
        };
        self.connection
            .request_typed::<_, ConfigChangeBatchListenBody>(&request)
            .await?;
        Ok(())
    }

    /// Hand a refetch to the refresh worker. False once the worker has exited.
    pub fn queue_refresh(&self, data_id: &str, group: &str) -> bool {
        self.refresh_tx.send((data_id.to_string(), group.to_string())).is_ok()
    }

    /// Refresh worker: refetches queued items one at a time until shutdown.
    ///
    /// The refetch in progress when shutdown is signalled runs to completion;
    /// items still queued are dropped.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let span = tracing::info_span!("config_refresh");

        async move {
            let Some(mut queue) = self.refresh_rx.lock().await.take() else {
                warn!("Config refresh worker already started");
                return;
            };
            let _ = shutdown_rx.borrow_and_update();
            debug!("Starting config refresh worker");

            loop {
                let (data_id, group) = tokio::select! {
                    biased;
                    res = shutdown_rx.changed() => {
                        if res.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                    next = queue.recv() => match next {
                        Some(item) => item,
                        None => break,
                    },
                };
                if let Err(e) = self.refresh(&data_id, &group).await {
                    warn!(data_id = %data_id, group = %group, error = %e, "Config refresh failed");
                }
            }
            debug!(dropped = queue.len(), "Config refresh worker stopping");
        }
        .instrument(span)
        .await
    }

    /// Refetch a listened item and notify its listeners if it changed.
    ///
    /// Returns whether listeners were called.
    pub async fn refresh(&self, data_id: &str, group: &str) -> Result<bool> {
        let key = config_key(data_id, group, &self.tenant);
        if !self.listeners.contains_key(&key) {
            return Ok(false);
        }
        let fresh = self.fetch(data_id, group).await?;
        let old = self.cache.get(&key).map(|c| c.value().clone());
        let changed = match (&old, &fresh) {
            (Some(old), Some(new)) => old.checksum != new.checksum,
            (None, None) => false,
            _ => true,
        };
        if !changed {
            debug!(key = %key, "Config unchanged");
            return Ok(false);
        }
        match &fresh {
            Some(config) => {
                self.cache.insert(key.clone(), config.clone());
            }
            None => {
                self.cache.remove(&key);
            }
        }

        let event = {
            let filters = self.filters.read().await;
            ConfigChangeEvent {
                data_id: data_id.to_string(),
                group: group.to_string(),
                tenant: self.tenant.clone(),
                old_content: filtered_content(&filters, old)?,
                new_content: filtered_content(&filters, fresh)?,
            }
        };
        let listeners = self.listeners.get(&key).map(|l| l.value().clone()).unwrap_or_default();
        info!(key = %key, listeners = listeners.len(), "Config changed");
        for listener in listeners {
            listener.on_change(&event);
        }
        Ok(true)
    }
}

fn filtered_content(filters: &ConfigFilterChain, config: Option<ConfigSnapshot>) -> Result<Option<String>> {
    match config {
        Some(mut config) => {
            filters.apply(ConfigPhase::Get, &mut config)?;
            Ok(Some(config.content))
        }
        None => Ok(None),
    }
}

fn validate(data_id: &str, group: &str) -> Result<()> {
    for (name, value) in [("dataId", data_id), ("group", group)] {
        if value.trim().is_empty() {
            return Err(ClientError::InvalidInput(format!("{} must not be empty", name)));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
        {
            return Err(ClientError::InvalidInput(format!("{} {:?} has invalid characters", name, value)));
        }
    }
    Ok(())
}

fn is_true(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("true") || answer.trim().eq_ignore_ascii_case("ok")
}

/// Answers `ConfigChangeNotifyRequest` pushes and queues the refetch.
pub struct ConfigChangeNotifyHandler {
    service: Weak<ConfigService>,
}

impl ConfigChangeNotifyHandler {
    pub fn new(service: &Arc<ConfigService>) -> Self {
        Self {
            service: Arc::downgrade(service),
        }
    }
}

impl ServerRequestHandler for ConfigChangeNotifyHandler {
    fn handle<'a>(&'a self, push: &'a Payload) -> BoxFuture<'a, Option<Payload>> {
        Box::pin(async move {
            if push.message_type() != ConfigChangeNotifyRequest::TYPE {
                return Ok(None);
            }
            let notify: ConfigChangeNotifyRequest = decode(push)?;
            if let Some(service) = self.service.upgrade() {
                if notify.tenant == service.tenant {
                    if !service.queue_refresh(&notify.data_id, &notify.group) {
                        debug!(data_id = %notify.data_id, "Config push after refresh worker stopped");
                    }
                } else {
                    debug!(tenant = %notify.tenant, "Config push for another tenant");
                }
            }
            let ack = encode_as(
                &response_type_for(ConfigChangeNotifyRequest::TYPE),
                &ResponseStatus::success(notify.request_id),
                "",
            )?;
            Ok(Some(ack))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::redo::RedoType;
    use crate::remote::payload::encode;
    use crate::remote::{ConnectionSettings, Connector, RpcConnection, ServerCheckInfo};
    use crate::security::{AccessToken, Authenticator, SecurityProxy};
    use crate::server_list::{ServerEndpoint, ServerListManager};
    use crate::transport::ResilientTransport;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Unreachable;

    impl Connector for Unreachable {
        fn connect<'a>(&'a self, server: &'a ServerEndpoint) -> BoxFuture<'a, (Arc<dyn RpcConnection>, ServerCheckInfo)> {
            Box::pin(async move { Err(ClientError::transient(server.address(), "connection refused")) })
        }
    }

    struct NoAuth;

    impl Authenticator for NoAuth {
        fn login<'a>(&'a self, _s: &'a str, _u: &'a str, _p: &'a str) -> BoxFuture<'a, AccessToken> {
            Box::pin(async { Err(ClientError::AuthDenied("unused".into())) })
        }
    }

    struct Noop;

    impl ConfigChangeListener for Noop {
        fn on_change(&self, _event: &ConfigChangeEvent) {}
    }

    /// Service pointed at a port nothing listens on.
    fn service(store: Option<Arc<SnapshotStore>>) -> (Arc<ConfigService>, Arc<FailoverReactor>, Arc<RedoService>) {
        let config = ClientConfig::for_testing(&["127.0.0.1:1"]);
        let servers = Arc::new(ServerListManager::new(config.server_addrs.as_slice()).unwrap());
        let security = Arc::new(SecurityProxy::new(&config, Arc::clone(&servers), Arc::new(NoAuth)));
        let http = Arc::new(HttpTransport::new(
            reqwest::Client::new(),
            ResilientTransport::new(Arc::clone(&servers), Arc::clone(&security), Duration::from_millis(200)),
            &config,
        ));
        let connection = Arc::new(ConnectionManager::new(
            Arc::new(Unreachable),
            servers,
            Some(security),
            ConnectionSettings::from_config(&config),
        ));
        let redo = Arc::new(RedoService::new(&config.redo));
        let failover = Arc::new(FailoverReactor::new(None, Duration::from_secs(1)));
        let service = Arc::new(ConfigService::new(
            "",
            connection,
            http,
            Arc::clone(&redo),
            Arc::clone(&failover),
            store,
        ));
        (service, failover, redo)
    }

    #[tokio::test]
    async fn test_failover_copy_served_first() {
        let (service, failover, _) = service(None);
        failover.set_data(FailoverEntry::config(ConfigSnapshot::new("app", "g", "", "from-disk")));
        failover.set_switch(true);
        assert_eq!(service.get_config("app", "g").await.unwrap().as_deref(), Some("from-disk"));
    }

    #[tokio::test]
    async fn test_unreachable_server_falls_back_to_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SnapshotStore::new(dir.path(), ""));
        store
            .write(&FailoverEntry::config(ConfigSnapshot::new("app", "g", "", "cached")))
            .await
            .unwrap();
        let (service, _, _) = service(Some(store));

        assert_eq!(service.get_config("app", "g").await.unwrap().as_deref(), Some("cached"));
        let err = service.get_config("other", "g").await.unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn test_invalid_identifiers_rejected() {
        let (service, _, _) = service(None);
        assert!(matches!(service.get_config("", "g").await, Err(ClientError::InvalidInput(_))));
        assert!(matches!(service.get_config("a b", "g").await, Err(ClientError::InvalidInput(_))));
        assert!(matches!(
            service.publish_config("app", "g", "  ", None).await,
            Err(ClientError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_listener_intent_queued_while_disconnected() {
        let (service, _, redo) = service(None);
        let listener: Arc<dyn ConfigChangeListener> = Arc::new(Noop);
        service.add_listener("app", "g", Arc::clone(&listener)).await.unwrap();
        service.add_listener("app", "g", Arc::new(Noop)).await.unwrap();
        assert_eq!(service.listener_count("app", "g"), 2);
        assert_eq!(redo.config_listeners().get("app+g").unwrap().redo_type(), RedoType::Register);

        service.remove_listener("app", "g", &listener).await.unwrap();
        assert_eq!(service.listener_count("app", "g"), 1);
        assert!(redo.config_listeners().contains("app+g"));
    }

    #[tokio::test]
    async fn test_last_listener_removal_drops_unconfirmed_intent() {
        let (service, _, redo) = service(None);
        let listener: Arc<dyn ConfigChangeListener> = Arc::new(Noop);
        service.add_listener("app", "g", Arc::clone(&listener)).await.unwrap();
        service.remove_listener("app", "g", &listener).await.unwrap();
        assert_eq!(service.listener_count("app", "g"), 0);
        assert!(redo.config_listeners().is_empty());
    }

    #[tokio::test]
    async fn test_notify_push_is_acked() {
        let (service, _, _) = service(None);
        let handler = ConfigChangeNotifyHandler::new(&service);
        let push = ConfigChangeNotifyRequest {
            request_id: Some("9".into()),
            data_id: "app".into(),
            group: "g".into(),
            tenant: String::new(),
        };
        let answer = handler.handle(&encode(&push, "").unwrap()).await.unwrap().unwrap();
        assert_eq!(answer.message_type(), "ConfigChangeNotifyResponse");
        let status: ResponseStatus = decode(&answer).unwrap();
        assert_eq!(status.request_id.as_deref(), Some("9"));
        // The refetch is queued for the worker, not run on the push path.
        assert_eq!(service.refresh_rx.lock().await.as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_worker_joins_on_shutdown_mid_refresh() {
        let (service, _, _) = service(None);
        // A listener makes the refetch go to the (unreachable) server.
        service.add_listener("app", "g", Arc::new(Noop)).await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(Arc::clone(&service).run(shutdown_rx));

        for _ in 0..5 {
            assert!(service.queue_refresh("app", "g"));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("refresh worker did not stop")
            .unwrap();
        assert!(!service.queue_refresh("app", "g"));
    }

    #[tokio::test]
    async fn test_refresh_worker_starts_once() {
        let (service, _, _) = service(None);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let first = tokio::spawn(Arc::clone(&service).run(shutdown_rx.clone()));
        tokio::time::sleep(Duration::from_millis(5)).await;

        // A second worker finds the queue taken and returns at once.
        tokio::time::timeout(Duration::from_secs(1), Arc::clone(&service).run(shutdown_rx))
            .await
            .expect("second worker should return immediately");
        assert!(!first.is_finished());
        first.abort();
    }
}
