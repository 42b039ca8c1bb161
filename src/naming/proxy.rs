// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Naming facade over the gRPC connection.
//!
//! Ephemeral instances and subscriptions are recorded in the redo registries
//! before the request goes out. A connectivity failure leaves that intent
//! queued and is reported as success: the redo worker finishes the job once a
//! connection is back. Any other failure is returned to the caller and the
//! intent is dropped, so nothing the caller saw fail is replayed later.
//! Persistent instances go over HTTP and are never replayed.

use super::holder::ServiceInfoHolder;
use super::messages::{
    BatchInstanceRequest, InstanceRequest, NotifySubscriberRequest, ServiceInfoBody, ServiceQueryRequest,
    SubscribeServiceRequest, BATCH_REGISTER_INSTANCE, DEREGISTER_INSTANCE, REGISTER_INSTANCE,
};
use super::model::{cluster_list, grouped_name, service_key, Instance, ServiceSnapshot};
use crate::error::{BoxFuture, ClientError, Result};
use crate::redo::{InstanceRedo, InstanceRedoData, RedoService, SubscribeRedo};
use crate::remote::payload::{decode, encode_as, next_request_id, response_type_for, EmptyBody, ResponseStatus};
use crate::remote::{ConnectionManager, Payload, RemoteMessage, ServerRequestHandler};
use crate::transport::HttpTransport;
use std::sync::Arc;
use tracing::{debug, info, warn};

const INSTANCE_PATH: &str = "/v1/ns/instance";

pub struct NamingGrpcProxy {
    namespace: String,
    connection: Arc<ConnectionManager>,
    http: Arc<HttpTransport>,
    redo: Arc<RedoService>,
    holder: Arc<ServiceInfoHolder>,
}

impl NamingGrpcProxy {
    pub fn new(
        namespace: impl Into<String>,
        connection: Arc<ConnectionManager>,
        http: Arc<HttpTransport>,
        redo: Arc<RedoService>,
        holder: Arc<ServiceInfoHolder>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            connection,
            http,
            redo,
            holder,
        }
    }

    pub fn holder(&self) -> &Arc<ServiceInfoHolder> {
        &self.holder
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Instances
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn register_instance(&self, service_name: &str, group_name: &str, instance: Instance) -> Result<()> {
        validate_service(service_name, group_name)?;
        instance.validate()?;
        if !instance.ephemeral {
            return self.register_persistent(service_name, group_name, &instance).await;
        }

        let data = InstanceRedoData {
            service_name: service_name.to_string(),
            group_name: group_name.to_string(),
            instances: InstanceRedo::Single(instance),
        };
        self.register_with_redo(data).await
    }

    /// Register several ephemeral instances of one service as a unit.
    ///
    /// Replaces any instance previously registered for the service.
    pub async fn batch_register_instances(
        &self,
        service_name: &str,
        group_name: &str,
        instances: Vec<Instance>,
    ) -> Result<()> {
        validate_service(service_name, group_name)?;
        if instances.is_empty() {
            return Err(ClientError::InvalidInput("batch register needs at least one instance".to_string()));
        }
        for instance in &instances {
            instance.validate()?;
            if !instance.ephemeral {
                return Err(ClientError::InvalidInput(format!(
                    "batch register only supports ephemeral instances, {} is persistent",
                    instance.key()
                )));
            }
        }
        let data = InstanceRedoData {
            service_name: service_name.to_string(),
            group_name: group_name.to_string(),
            instances: InstanceRedo::Batch(instances),
        };
        self.register_with_redo(data).await
    }

    /// Deregister the service's instance intent.
    ///
    /// Ephemeral registrations are held per service and connection, so this
    /// unwinds the whole intent recorded under the service, including every
    /// member of a batch, whatever `instance` names. `instance` only selects
    /// the transport (persistent or ephemeral) and is what gets sent when no
    /// intent is recorded.
    pub async fn deregister_instance(&self, service_name: &str, group_name: &str, instance: Instance) -> Result<()> {
        validate_service(service_name, group_name)?;
        if !instance.ephemeral {
            return self.deregister_persistent(service_name, group_name, &instance).await;
        }

        let key = grouped_name(service_name, group_name);
        // An unknown key may still be live on the server, so treat it as registered.
        let (data, confirmed) = match self.redo.instances().get(&key) {
            Some(entry) => {
                if !entry.data.instances.contains(&instance) {
                    debug!(
                        service = %key,
                        instance = %instance.key(),
                        "Instance not in recorded intent, deregistering the service's intent"
                    );
                }
                (entry.data, entry.registered)
            }
            None => {
                let data = InstanceRedoData {
                    service_name: service_name.to_string(),
                    group_name: group_name.to_string(),
                    instances: InstanceRedo::Single(instance),
                };
                self.redo.instances().cache_for_redo(&key, data.clone());
                self.redo.instances().mark_registered(&key);
                (data, true)
            }
        };
        self.redo.instances().mark_unregistering(&key);

        match self.do_deregister(&data).await {
            Ok(()) => {
                self.redo.instances().mark_unregistered(&key);
                self.redo.instances().remove_if_unwound(&key);
                info!(service = %key, "Instance deregistered");
                Ok(())
            }
            Err(e) if e.is_connectivity() => {
                if confirmed {
                    warn!(service = %key, error = %e, "Deregister deferred to redo");
                } else {
                    // The register never reached the server; nothing to undo.
                    self.redo.instances().mark_unregistered(&key);
                    self.redo.instances().remove_if_unwound(&key);
                    debug!(service = %key, "Dropped unconfirmed register intent");
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn register_with_redo(&self, data: InstanceRedoData) -> Result<()> {
        let key = data.key();
        self.redo.instances().cache_for_redo(&key, data.clone());
        match self.do_register(&data).await {
            Ok(()) => {
                self.redo.instances().mark_registered(&key);
                info!(service = %key, "Instance registered");
                Ok(())
            }
            Err(e) if e.is_connectivity() => {
                warn!(service = %key, error = %e, "Register deferred to redo");
                Ok(())
            }
            Err(e) => {
                self.redo.instances().remove(&key);
                warn!(service = %key, error = %e, "Register rejected");
                Err(e)
            }
        }
    }

    /// Send the register call for an intent. No redo bookkeeping.
    pub(crate) async fn do_register(&self, data: &InstanceRedoData) -> Result<()> {
        match &data.instances {
            InstanceRedo::Single(instance) => {
                let request = self.instance_request(data, REGISTER_INSTANCE, instance.clone());
                self.connection.request_typed::<_, EmptyBody>(&request).await?;
            }
            InstanceRedo::Batch(instances) => {
                let request = BatchInstanceRequest {
                    request_id: next_request_id(),
                    namespace: self.namespace.clone(),
                    service_name: data.service_name.clone(),
                    group_name: data.group_name.clone(),
                    operation: BATCH_REGISTER_INSTANCE.to_string(),
                    instances: instances.clone(),
                };
                self.connection.request_typed::<_, EmptyBody>(&request).await?;
            }
        }
        Ok(())
    }

    /// Send the deregister call(s) for an intent. No redo bookkeeping.
    pub(crate) async fn do_deregister(&self, data: &InstanceRedoData) -> Result<()> {
        let instances = match &data.instances {
            InstanceRedo::Single(instance) => std::slice::from_ref(instance),
            InstanceRedo::Batch(instances) => instances.as_slice(),
        };
        for instance in instances {
            let request = self.instance_request(data, DEREGISTER_INSTANCE, instance.clone());
            self.connection.request_typed::<_, EmptyBody>(&request).await?;
        }
        Ok(())
    }

    fn instance_request(&self, data: &InstanceRedoData, operation: &str, instance: Instance) -> InstanceRequest {
        InstanceRequest {
            request_id: next_request_id(),
            namespace: self.namespace.clone(),
            service_name: data.service_name.clone(),
            group_name: data.group_name.clone(),
            operation: operation.to_string(),
            instance,
        }
    }

    async fn register_persistent(&self, service_name: &str, group_name: &str, instance: &Instance) -> Result<()> {
        let mut params = self.persistent_params(service_name, group_name, instance);
        params.push(("weight", instance.weight.to_string()));
        params.push(("enable", instance.enabled.to_string()));
        params.push(("healthy", instance.healthy.to_string()));
        params.push(("metadata", serde_json::to_string(&instance.metadata)?));
        self.http.post_form("register_instance", INSTANCE_PATH, &params).await?;
        info!(service = %grouped_name(service_name, group_name), instance = %instance.key(), "Persistent instance registered");
        Ok(())
    }

    async fn deregister_persistent(&self, service_name: &str, group_name: &str, instance: &Instance) -> Result<()> {
        let params = self.persistent_params(service_name, group_name, instance);
        self.http.delete("deregister_instance", INSTANCE_PATH, &params).await?;
        info!(service = %grouped_name(service_name, group_name), instance = %instance.key(), "Persistent instance deregistered");
        Ok(())
    }

    fn persistent_params(&self, service_name: &str, group_name: &str, instance: &Instance) -> Vec<(&'static str, String)> {
        vec![
            ("namespaceId", self.namespace.clone()),
            ("serviceName", grouped_name(service_name, group_name)),
            ("groupName", group_name.to_string()),
            ("clusterName", instance.cluster_name.clone()),
            ("ip", instance.ip.clone()),
            ("port", instance.port.to_string()),
            ("ephemeral", "false".to_string()),
        ]
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Subscriptions
    // ═══════════════════════════════════════════════════════════════════════════

    /// Subscribe and return the current view.
    ///
    /// When the server cannot be reached the subscription stays queued and the
    /// cached (possibly empty) view is returned.
    pub async fn subscribe(&self, service_name: &str, group_name: &str, clusters: &[String]) -> Result<ServiceSnapshot> {
        validate_service(service_name, group_name)?;
        let data = SubscribeRedo {
            service_name: service_name.to_string(),
            group_name: group_name.to_string(),
            clusters: cluster_list(clusters),
        };
        let key = data.key();
        self.redo.subscribers().cache_for_redo(&key, data.clone());

        match self.do_subscribe(&data).await {
            Ok(snapshot) => {
                self.redo.subscribers().mark_registered(&key);
                info!(service = %key, hosts = snapshot.hosts.len(), "Subscribed");
                Ok(self.holder.get_by_key(&key).unwrap_or(snapshot))
            }
            Err(e) if e.is_connectivity() => {
                warn!(service = %key, error = %e, "Subscribe deferred to redo");
                Ok(self
                    .holder
                    .get_by_key(&key)
                    .unwrap_or_else(|| empty_view(&data)))
            }
            Err(e) => {
                self.redo.subscribers().remove(&key);
                warn!(service = %key, error = %e, "Subscribe rejected");
                Err(e)
            }
        }
    }

    pub async fn unsubscribe(&self, service_name: &str, group_name: &str, clusters: &[String]) -> Result<()> {
        validate_service(service_name, group_name)?;
        let data = SubscribeRedo {
            service_name: service_name.to_string(),
            group_name: group_name.to_string(),
            clusters: cluster_list(clusters),
        };
        let key = data.key();
        if !self.redo.subscribers().contains(&key) {
            debug!(service = %key, "Unsubscribe for unknown subscription");
            return Ok(());
        }
        let confirmed = self.redo.subscribers().is_registered(&key);
        self.redo.subscribers().mark_unregistering(&key);

        match self.do_unsubscribe(&data).await {
            Ok(()) => {
                self.redo.subscribers().mark_unregistered(&key);
                self.redo.subscribers().remove_if_unwound(&key);
                info!(service = %key, "Unsubscribed");
                Ok(())
            }
            Err(e) if e.is_connectivity() => {
                if confirmed {
                    warn!(service = %key, error = %e, "Unsubscribe deferred to redo");
                } else {
                    self.redo.subscribers().mark_unregistered(&key);
                    self.redo.subscribers().remove_if_unwound(&key);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn is_subscribed(&self, service_name: &str, group_name: &str, clusters: &[String]) -> bool {
        let key = service_key(service_name, group_name, &cluster_list(clusters));
        self.redo.subscribers().is_registered(&key)
    }

    /// Send the subscribe call and feed the answer to the holder.
    pub(crate) async fn do_subscribe(&self, data: &SubscribeRedo) -> Result<ServiceSnapshot> {
        let request = SubscribeServiceRequest {
            request_id: next_request_id(),
            namespace: self.namespace.clone(),
            service_name: data.service_name.clone(),
            group_name: data.group_name.clone(),
            clusters: data.clusters.clone(),
            subscribe: true,
        };
        let body: ServiceInfoBody = self.connection.request_typed(&request).await?;
        let snapshot = body.service_info.unwrap_or_else(|| empty_view(data));
        self.holder.process_service_info(snapshot.clone()).await;
        Ok(snapshot)
    }

    pub(crate) async fn do_unsubscribe(&self, data: &SubscribeRedo) -> Result<()> {
        let request = SubscribeServiceRequest {
            request_id: next_request_id(),
            namespace: self.namespace.clone(),
            service_name: data.service_name.clone(),
            group_name: data.group_name.clone(),
            clusters: data.clusters.clone(),
            subscribe: false,
        };
        self.connection.request_typed::<_, ServiceInfoBody>(&request).await?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════════

    /// One-shot query. Served from failover data while the switch is on.
    pub async fn query_instances(
        &self,
        service_name: &str,
        group_name: &str,
        clusters: &[String],
        healthy_only: bool,
    ) -> Result<ServiceSnapshot> {
        validate_service(service_name, group_name)?;
        let clusters = cluster_list(clusters);
        let key = service_key(service_name, group_name, &clusters);
        if let Some(snapshot) = self.holder.failover_view(&key) {
            debug!(service = %key, "Query served from failover data");
            return Ok(snapshot);
        }

        let request = ServiceQueryRequest {
            request_id: next_request_id(),
            namespace: self.namespace.clone(),
            service_name: service_name.to_string(),
            group_name: group_name.to_string(),
            cluster: clusters.clone(),
            healthy_only,
            udp_port: 0,
        };
        let body: ServiceInfoBody = self.connection.request_typed(&request).await?;
        Ok(body.service_info.unwrap_or_else(|| {
            let mut empty = ServiceSnapshot::new(service_name, group_name, Vec::new(), 0);
            empty.clusters = clusters;
            empty
        }))
    }

    /// Instances to call: the subscribed view when there is one, else a query.
    pub async fn select_instances(
        &self,
        service_name: &str,
        group_name: &str,
        clusters: &[String],
        healthy: bool,
    ) -> Result<Vec<Instance>> {
        let key = service_key(service_name, group_name, &cluster_list(clusters));
        let cached = if self.redo.subscribers().contains(&key) {
            self.holder.get_by_key(&key)
        } else {
            self.holder.failover_view(&key)
        };
        let snapshot = match cached {
            Some(snapshot) => snapshot,
            None => self.query_instances(service_name, group_name, clusters, false).await?,
        };
        Ok(snapshot
            .hosts
            .into_iter()
            .filter(|h| h.enabled && h.healthy == healthy && h.weight > 0.0)
            .collect())
    }

    pub fn get_service_info(&self, service_name: &str, group_name: &str, clusters: &[String]) -> Option<ServiceSnapshot> {
        self.holder.get_service_info(service_name, group_name, &cluster_list(clusters))
    }
}

fn validate_service(service_name: &str, group_name: &str) -> Result<()> {
    if service_name.trim().is_empty() {
        return Err(ClientError::InvalidInput("service name must not be empty".to_string()));
    }
    if group_name.trim().is_empty() {
        return Err(ClientError::InvalidInput("group name must not be empty".to_string()));
    }
    if service_name.contains(super::model::KEY_SEPARATOR) || group_name.contains(super::model::KEY_SEPARATOR) {
        return Err(ClientError::InvalidInput(format!(
            "service and group names must not contain {:?}",
            super::model::KEY_SEPARATOR
        )));
    }
    Ok(())
}

fn empty_view(data: &SubscribeRedo) -> ServiceSnapshot {
    let mut snapshot = ServiceSnapshot::new(data.service_name.clone(), data.group_name.clone(), Vec::new(), 0);
    snapshot.clusters = data.clusters.clone();
    snapshot
}

/// Answers `NotifySubscriberRequest` pushes by feeding the holder.
pub struct NotifySubscriberHandler {
    holder: Arc<ServiceInfoHolder>,
}

impl NotifySubscriberHandler {
    pub fn new(holder: Arc<ServiceInfoHolder>) -> Self {
        Self { holder }
    }
}

impl ServerRequestHandler for NotifySubscriberHandler {
    fn handle<'a>(&'a self, push: &'a Payload) -> BoxFuture<'a, Option<Payload>> {
        Box::pin(async move {
            if push.message_type() != NotifySubscriberRequest::TYPE {
                return Ok(None);
            }
            let notify: NotifySubscriberRequest = decode(push)?;
            debug!(
                service = %notify.service_info.key(),
                hosts = notify.service_info.hosts.len(),
                "Service change pushed"
            );
            self.holder.process_service_info(notify.service_info).await;
            let ack = encode_as(
                &response_type_for(NotifySubscriberRequest::TYPE),
                &ResponseStatus::success(notify.request_id),
                "",
            )?;
            Ok(Some(ack))
        })
    }
}
