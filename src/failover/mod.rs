// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failover reactor: switch-gated local data that overrides the server.
//!
//! An operator flips the switch (a file, by default) and drops snapshot files
//! next to it. While the switch is on, naming and config lookups are answered
//! from this data instead of the server. While it is off, the reactor reports
//! nothing, even if data is cached.
//!
//! The cache is refreshed from a [`FailoverDataSource`] on a fixed delay.
//! Every insert, replace or removal is published as a [`FailoverChange`] on a
//! broadcast channel; a slow subscriber only loses its own backlog.

pub mod disk;

pub use disk::{DiskFailoverDataSource, SnapshotStore};

use crate::config_service::ConfigSnapshot;
use crate::error::{BoxFuture, Result};
use crate::metrics;
use crate::naming::model::ServiceSnapshot;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn, Instrument};

/// Broadcast buffer for change events.
const CHANGE_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverKind {
    Naming,
    Config,
}

impl FailoverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Naming => "naming",
            Self::Config => "config",
        }
    }
}

impl std::fmt::Display for FailoverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailoverPayload {
    Naming(ServiceSnapshot),
    Config(ConfigSnapshot),
}

impl FailoverPayload {
    pub fn kind(&self) -> FailoverKind {
        match self {
            Self::Naming(_) => FailoverKind::Naming,
            Self::Config(_) => FailoverKind::Config,
        }
    }
}

/// One piece of failover data.
#[derive(Debug, Clone, PartialEq)]
pub struct FailoverEntry {
    pub key: String,
    pub payload: FailoverPayload,
}

impl FailoverEntry {
    pub fn naming(snapshot: ServiceSnapshot) -> Self {
        Self {
            key: snapshot.key(),
            payload: FailoverPayload::Naming(snapshot),
        }
    }

    pub fn config(snapshot: ConfigSnapshot) -> Self {
        Self {
            key: snapshot.key(),
            payload: FailoverPayload::Config(snapshot),
        }
    }

    pub fn kind(&self) -> FailoverKind {
        self.payload.kind()
    }

    pub fn as_service(&self) -> Option<&ServiceSnapshot> {
        match &self.payload {
            FailoverPayload::Naming(s) => Some(s),
            FailoverPayload::Config(_) => None,
        }
    }

    pub fn as_config(&self) -> Option<&ConfigSnapshot> {
        match &self.payload {
            FailoverPayload::Config(c) => Some(c),
            FailoverPayload::Naming(_) => None,
        }
    }
}

/// Published whenever the cache changes.
#[derive(Debug, Clone, PartialEq)]
pub struct FailoverChange {
    pub kind: FailoverKind,
    pub key: String,
    pub old: Option<FailoverEntry>,
    pub new: Option<FailoverEntry>,
}

/// Where failover data comes from.
pub trait FailoverDataSource: Send + Sync {
    fn get_switch<'a>(&'a self) -> BoxFuture<'a, bool>;

    /// Every entry currently available. Unreadable items are skipped.
    fn get_failover_data<'a>(&'a self) -> BoxFuture<'a, Vec<FailoverEntry>>;
}

pub struct FailoverReactor {
    enabled: AtomicBool,
    data: DashMap<(FailoverKind, String), FailoverEntry>,
    changes: broadcast::Sender<FailoverChange>,
    source: Option<Arc<dyn FailoverDataSource>>,
    refresh_interval: Duration,
}

impl FailoverReactor {
    pub fn new(source: Option<Arc<dyn FailoverDataSource>>, refresh_interval: Duration) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            enabled: AtomicBool::new(false),
            data: DashMap::new(),
            changes,
            source,
            refresh_interval,
        }
    }

    pub fn set_switch(&self, enabled: bool) {
        let previous = self.enabled.swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            metrics::set_failover_switch(enabled);
            info!(enabled, cached = self.data.len(), "Failover switch changed");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Data for `key`, only while the switch is on.
    pub fn get_data(&self, kind: FailoverKind, key: &str) -> Option<FailoverEntry> {
        if !self.is_enabled() {
            return None;
        }
        let entry = self.data.get(&(kind, key.to_string())).map(|e| e.value().clone());
        if entry.is_some() {
            metrics::record_failover_hit(kind.as_str());
        }
        entry
    }

    pub fn has_data(&self, kind: FailoverKind, key: &str) -> bool {
        self.is_enabled() && self.data.contains_key(&(kind, key.to_string()))
    }

    /// Cached entries regardless of the switch.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn set_data(&self, entry: FailoverEntry) {
        let kind = entry.kind();
        let key = entry.key.clone();
        let old = self.data.insert((kind, key.clone()), entry.clone());
        if old.as_ref() != Some(&entry) {
            self.publish(FailoverChange {
                kind,
                key,
                old,
                new: Some(entry),
            });
        }
    }

    pub fn remove_data(&self, kind: FailoverKind, key: &str) -> Option<FailoverEntry> {
        let old = self.data.remove(&(kind, key.to_string())).map(|(_, v)| v);
        if old.is_some() {
            self.publish(FailoverChange {
                kind,
                key: key.to_string(),
                old: old.clone(),
                new: None,
            });
        }
        old
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FailoverChange> {
        self.changes.subscribe()
    }

    fn publish(&self, change: FailoverChange) {
        debug!(kind = %change.kind, key = %change.key, "Failover data changed");
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    /// Poll the data source once.
    pub async fn refresh_once(&self) -> Result<()> {
        let Some(source) = &self.source else {
            return Ok(());
        };

        let enabled = source.get_switch().await?;
        self.set_switch(enabled);
        if !enabled {
            return Ok(());
        }

        let fresh = source.get_failover_data().await?;
        let fresh_keys: HashSet<(FailoverKind, String)> = fresh.iter().map(|e| (e.kind(), e.key.clone())).collect();
        let stale: Vec<(FailoverKind, String)> = self
            .data
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| !fresh_keys.contains(k))
            .collect();

        for (kind, key) in stale {
            self.remove_data(kind, &key);
        }
        for entry in fresh {
            self.set_data(entry);
        }
        Ok(())
    }

    /// Refresh on a fixed delay until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let span = tracing::info_span!("failover");

        async move {
            let _ = shutdown_rx.borrow_and_update();
            info!(
                interval_ms = self.refresh_interval.as_millis() as u64,
                "Starting failover refresh worker"
            );

            loop {
                if let Err(e) = self.refresh_once().await {
                    warn!(error = %e, "Failover refresh failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.refresh_interval) => {}
                    res = shutdown_rx.changed() => {
                        if res.is_err() || *shutdown_rx.borrow() {
                            debug!("Failover worker stopping");
                            break;
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}
