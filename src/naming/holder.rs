// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory service cache fed by query answers and server pushes.

use super::differ::{InstancesDiff, InstancesDiffer};
use super::model::{service_key, Instance, ServiceSnapshot};
use crate::config::NamingConfig;
use crate::failover::{FailoverEntry, FailoverKind, FailoverReactor, SnapshotStore};
use crate::metrics;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_BUFFER: usize = 256;

/// Published when a service's instance list changes.
#[derive(Debug, Clone, PartialEq)]
pub struct InstancesChangeEvent {
    pub service_name: String,
    pub group_name: String,
    pub clusters: String,
    pub hosts: Vec<Instance>,
    pub diff: InstancesDiff,
}

pub struct ServiceInfoHolder {
    services: DashMap<String, ServiceSnapshot>,
    differ: InstancesDiffer,
    push_empty_protection: bool,
    snapshots: Option<Arc<SnapshotStore>>,
    failover: Arc<FailoverReactor>,
    events: broadcast::Sender<InstancesChangeEvent>,
}

impl ServiceInfoHolder {
    pub fn new(config: &NamingConfig, snapshots: Option<Arc<SnapshotStore>>, failover: Arc<FailoverReactor>) -> Self {
        let tolerance = i64::try_from(config.stale_push_tolerance_ms).unwrap_or(i64::MAX);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            services: DashMap::new(),
            differ: InstancesDiffer::new(tolerance),
            push_empty_protection: config.push_empty_protection,
            snapshots,
            failover,
            events,
        }
    }

    /// Apply a fresh view from the server.
    ///
    /// Returns the diff that was applied, or `None` when the view was ignored
    /// (stale, or empty under push-empty protection).
    pub async fn process_service_info(&self, snapshot: ServiceSnapshot) -> Option<InstancesDiff> {
        let key = snapshot.key();
        let old = self.services.get(&key).map(|s| s.value().clone());

        if let Some(old) = &old {
            if self.differ.is_stale(old, &snapshot) {
                metrics::record_push_ignored("stale");
                debug!(
                    service = %key,
                    cached = old.last_ref_time,
                    pushed = snapshot.last_ref_time,
                    "Ignoring stale service info"
                );
                return None;
            }
            if self.push_empty_protection && snapshot.hosts.is_empty() && !old.hosts.is_empty() {
                metrics::record_push_ignored("empty");
                warn!(service = %key, "Ignoring empty instance list (push-empty protection)");
                return None;
            }
        }

        let diff = self.differ.diff(old.as_ref(), &snapshot);
        self.services.insert(key.clone(), snapshot.clone());

        if diff.has_changes() || old.is_none() {
            if let Some(store) = &self.snapshots {
                if let Err(e) = store.write(&FailoverEntry::naming(snapshot.clone())).await {
                    warn!(service = %key, error = %e, "Failed to persist service snapshot");
                }
            }
        }

        if diff.has_changes() {
            metrics::record_instances_changed(&key, diff.added.len(), diff.removed.len(), diff.modified.len());
            info!(
                service = %key,
                added = diff.added.len(),
                removed = diff.removed.len(),
                modified = diff.modified.len(),
                "Service instances changed"
            );
            let _ = self.events.send(InstancesChangeEvent {
                service_name: snapshot.name.clone(),
                group_name: snapshot.group_name.clone(),
                clusters: snapshot.clusters.clone(),
                hosts: snapshot.hosts.clone(),
                diff: diff.clone(),
            });
        }
        Some(diff)
    }

    /// Cached view, preferring failover data while the switch is on.
    pub fn get_service_info(&self, service_name: &str, group_name: &str, clusters: &str) -> Option<ServiceSnapshot> {
        self.get_by_key(&service_key(service_name, group_name, clusters))
    }

    pub fn get_by_key(&self, key: &str) -> Option<ServiceSnapshot> {
        self.failover_view(key)
            .or_else(|| self.services.get(key).map(|s| s.value().clone()))
    }

    /// Failover data for `key`, only while the switch is on.
    pub fn failover_view(&self, key: &str) -> Option<ServiceSnapshot> {
        self.failover
            .get_data(FailoverKind::Naming, key)
            .and_then(|entry| entry.as_service().cloned())
    }

    pub fn remove(&self, key: &str) -> Option<ServiceSnapshot> {
        self.services.remove(key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<InstancesChangeEvent> {
        self.events.subscribe()
    }

    /// Restore persisted snapshots into memory. No events are published.
    pub async fn load_snapshots(&self) -> usize {
        let Some(store) = &self.snapshots else {
            return 0;
        };
        match store.read_all(FailoverKind::Naming).await {
            Ok(entries) => {
                let mut loaded = 0;
                for entry in entries {
                    if let Some(snapshot) = entry.as_service() {
                        self.services.insert(entry.key.clone(), snapshot.clone());
                        loaded += 1;
                    }
                }
                info!(loaded, "Service snapshots loaded");
                loaded
            }
            Err(e) => {
                warn!(error = %e, "Failed to load service snapshots");
                0
            }
        }
    }
}
