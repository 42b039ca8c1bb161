// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redo reconciliation engine.
//!
//! Every register / subscribe / lock / listen call records its intent here
//! before it goes to the server. When the connection drops, the server forgets
//! ephemeral state; when it comes back, the redo worker replays whatever the
//! registries say is missing.
//!
//! # Worker
//!
//! ```text
//! loop (fixed delay, default 3s):
//!     if !connected: skip
//!     for registry in [instances, subscribers, locks, config listeners]:
//!         for entry in registry.find_pending():   # point-in-time snapshot
//!             Register   -> executor.register*, mark_registered
//!             Unregister -> executor.unregister*, mark_unregistered, remove_if_unwound
//!             Remove     -> remove_if_unwound
//! ```
//!
//! A failing entry is logged and counted; it stays pending for the next tick
//! and does not stop the others. A server-side `InvalidInput` rejection drops
//! the intent, as does a lock the server reports as held elsewhere.

mod registry;

pub use registry::{RedoData, RedoRegistry, RedoType};

use crate::config::RedoConfig;
use crate::error::{BoxFuture, ClientError, Result};
use crate::metrics;
use crate::naming::model::{grouped_name, service_key, Instance};
use crate::remote::ConnectionEventListener;
use crate::resilience::RateLimiter;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

// ═══════════════════════════════════════════════════════════════════════════════
// Intent payloads
// ═══════════════════════════════════════════════════════════════════════════════

/// Instances registered under one service.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceRedo {
    Single(Instance),
    /// Replayed as one batch call.
    Batch(Vec<Instance>),
}

impl InstanceRedo {
    /// Matches on `ip:port`.
    pub fn contains(&self, instance: &Instance) -> bool {
        match self {
            Self::Single(held) => held.key() == instance.key(),
            Self::Batch(held) => held.iter().any(|h| h.key() == instance.key()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRedoData {
    pub service_name: String,
    pub group_name: String,
    pub instances: InstanceRedo,
}

impl InstanceRedoData {
    pub fn key(&self) -> String {
        grouped_name(&self.service_name, &self.group_name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeRedo {
    pub service_name: String,
    pub group_name: String,
    pub clusters: String,
}

impl SubscribeRedo {
    pub fn key(&self) -> String {
        service_key(&self.service_name, &self.group_name, &self.clusters)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LockRedo {
    pub key: String,
    /// Lease in millis; negative means no expiry.
    pub expire_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigListenRedo {
    pub data_id: String,
    pub group: String,
    pub tenant: String,
}

impl ConfigListenRedo {
    /// `dataId+group+tenant`.
    pub fn key(&self) -> String {
        config_key(&self.data_id, &self.group, &self.tenant)
    }
}

/// Key shared by the config listener registry and the config cache.
pub fn config_key(data_id: &str, group: &str, tenant: &str) -> String {
    if tenant.is_empty() {
        format!("{}+{}", data_id, group)
    } else {
        format!("{}+{}+{}", data_id, group, tenant)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Executor seam
// ═══════════════════════════════════════════════════════════════════════════════

/// Performs the server calls a replay needs. Implementations only talk to the
/// server; the service does all flag bookkeeping.
pub trait RedoExecutor: Send + Sync {
    fn register_instance<'a>(&'a self, data: &'a InstanceRedoData) -> BoxFuture<'a, ()>;
    fn deregister_instance<'a>(&'a self, data: &'a InstanceRedoData) -> BoxFuture<'a, ()>;
    fn subscribe<'a>(&'a self, data: &'a SubscribeRedo) -> BoxFuture<'a, ()>;
    fn unsubscribe<'a>(&'a self, data: &'a SubscribeRedo) -> BoxFuture<'a, ()>;
    /// `Ok(false)` means the lock is held elsewhere.
    fn lock<'a>(&'a self, data: &'a LockRedo) -> BoxFuture<'a, bool>;
    fn unlock<'a>(&'a self, data: &'a LockRedo) -> BoxFuture<'a, ()>;
    fn listen_config<'a>(&'a self, data: &'a ConfigListenRedo) -> BoxFuture<'a, ()>;
    fn unlisten_config<'a>(&'a self, data: &'a ConfigListenRedo) -> BoxFuture<'a, ()>;
}

/// Counters from one redo cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RedoStats {
    pub replayed: usize,
    pub failed: usize,
    pub removed: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// RedoService
// ═══════════════════════════════════════════════════════════════════════════════

/// Owns the four intent registries and the replay worker.
#[derive(Debug)]
pub struct RedoService {
    instances: RedoRegistry<InstanceRedoData>,
    subscribers: RedoRegistry<SubscribeRedo>,
    locks: RedoRegistry<LockRedo>,
    config_listeners: RedoRegistry<ConfigListenRedo>,
    connected: AtomicBool,
    delay: Duration,
    rate_limiter: Option<RateLimiter>,
}

impl RedoService {
    pub fn new(config: &RedoConfig) -> Self {
        let rate_limiter = config.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.per_second,
                burst = cfg.burst,
                "Rate limiting enabled for redo"
            );
            RateLimiter::new(cfg)
        });
        Self {
            instances: RedoRegistry::new("instance"),
            subscribers: RedoRegistry::new("subscriber"),
            locks: RedoRegistry::new("lock"),
            config_listeners: RedoRegistry::new("config_listener"),
            connected: AtomicBool::new(false),
            delay: config.delay_duration(),
            rate_limiter,
        }
    }

    pub fn instances(&self) -> &RedoRegistry<InstanceRedoData> {
        &self.instances
    }

    pub fn subscribers(&self) -> &RedoRegistry<SubscribeRedo> {
        &self.subscribers
    }

    pub fn locks(&self) -> &RedoRegistry<LockRedo> {
        &self.locks
    }

    pub fn config_listeners(&self) -> &RedoRegistry<ConfigListenRedo> {
        &self.config_listeners
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Run one reconciliation pass.
    pub async fn redo_once(&self, executor: &dyn RedoExecutor) -> RedoStats {
        let mut stats = RedoStats::default();
        if !self.is_connected() {
            debug!("Not connected, skipping redo");
            return stats;
        }

        let start = Instant::now();
        self.replay(
            &self.instances,
            move |d| async move { executor.register_instance(&d).await.map(|_| true) },
            move |d| async move { executor.deregister_instance(&d).await },
            &mut stats,
        )
        .await;
        self.replay(
            &self.subscribers,
            move |d| async move { executor.subscribe(&d).await.map(|_| true) },
            move |d| async move { executor.unsubscribe(&d).await },
            &mut stats,
        )
        .await;
        self.replay(
            &self.locks,
            move |d| async move { executor.lock(&d).await },
            move |d| async move { executor.unlock(&d).await },
            &mut stats,
        )
        .await;
        self.replay(
            &self.config_listeners,
            move |d| async move { executor.listen_config(&d).await.map(|_| true) },
            move |d| async move { executor.unlisten_config(&d).await },
            &mut stats,
        )
        .await;

        metrics::record_redo_cycle(stats.replayed, stats.failed, start.elapsed());
        for (kind, len) in [
            (self.instances.kind(), self.instances.len()),
            (self.subscribers.kind(), self.subscribers.len()),
            (self.locks.kind(), self.locks.len()),
            (self.config_listeners.kind(), self.config_listeners.len()),
        ] {
            metrics::set_redo_entries(kind, len);
        }
        if stats.replayed > 0 || stats.failed > 0 {
            info!(
                replayed = stats.replayed,
                failed = stats.failed,
                removed = stats.removed,
                "Redo cycle complete"
            );
        }
        stats
    }

    async fn replay<T, Reg, RegFut, Unreg, UnregFut>(
        &self,
        registry: &RedoRegistry<T>,
        register: Reg,
        unregister: Unreg,
        stats: &mut RedoStats,
    ) where
        T: Clone,
        Reg: Fn(T) -> RegFut,
        RegFut: Future<Output = Result<bool>>,
        Unreg: Fn(T) -> UnregFut,
        UnregFut: Future<Output = Result<()>>,
    {
        let kind = registry.kind();
        for entry in registry.find_pending() {
            let action = entry.redo_type();
            if action == RedoType::Remove {
                if registry.remove_if_unwound(&entry.key) {
                    stats.removed += 1;
                    debug!(kind, key = %entry.key, "Redo entry removed");
                }
                continue;
            }

            // Stop early if the connection dropped mid-cycle.
            if !self.is_connected() {
                debug!(kind, "Connection lost during redo, deferring the rest");
                return;
            }
            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }

            let outcome = match action {
                RedoType::Register => register(entry.data.clone()).await.map(|accepted| {
                    if accepted {
                        registry.mark_registered(&entry.key);
                    } else {
                        info!(kind, key = %entry.key, "Server refused replay, dropping intent");
                        registry.remove(&entry.key);
                    }
                }),
                RedoType::Unregister => unregister(entry.data.clone()).await.map(|()| {
                    registry.mark_unregistered(&entry.key);
                    if registry.remove_if_unwound(&entry.key) {
                        stats.removed += 1;
                    }
                }),
                RedoType::Remove | RedoType::None => Ok(()),
            };

            match outcome {
                Ok(()) => {
                    stats.replayed += 1;
                    metrics::record_redo(kind, action.as_str(), true);
                    debug!(kind, key = %entry.key, action = action.as_str(), "Redo applied");
                }
                Err(ClientError::InvalidInput(reason)) => {
                    stats.failed += 1;
                    metrics::record_redo(kind, action.as_str(), false);
                    warn!(kind, key = %entry.key, reason = %reason, "Server rejected intent, dropping it");
                    registry.remove(&entry.key);
                }
                Err(e) => {
                    stats.failed += 1;
                    metrics::record_redo(kind, action.as_str(), false);
                    warn!(
                        kind,
                        key = %entry.key,
                        action = action.as_str(),
                        error = %e,
                        "Redo failed, will retry next cycle"
                    );
                }
            }
        }
    }

    /// Replay on a fixed delay until shutdown.
    pub async fn run(self: Arc<Self>, executor: Arc<dyn RedoExecutor>, mut shutdown_rx: watch::Receiver<bool>) {
        let span = tracing::info_span!("redo");

        async move {
            let _ = shutdown_rx.borrow_and_update();
            info!(delay_ms = self.delay.as_millis() as u64, "Starting redo worker");

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {}
                    res = shutdown_rx.changed() => {
                        if res.is_err() || *shutdown_rx.borrow() {
                            debug!("Redo worker stopping");
                            break;
                        }
                    }
                }
                self.redo_once(executor.as_ref()).await;
            }
        }
        .instrument(span)
        .await
    }
}

impl ConnectionEventListener for RedoService {
    fn on_connected(&self) -> Result<()> {
        self.connected.store(true, Ordering::Release);
        info!(
            instances = self.instances.len(),
            subscribers = self.subscribers.len(),
            locks = self.locks.len(),
            config_listeners = self.config_listeners.len(),
            "Connected, redo enabled"
        );
        Ok(())
    }

    fn on_disconnected(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        self.instances.on_disconnect();
        self.subscribers.on_disconnect();
        self.locks.on_disconnect();
        self.config_listeners.on_disconnect();
        info!("Disconnected, intents marked for redo");
        Ok(())
    }
}
