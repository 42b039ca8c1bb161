// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory server for end-to-end tests.
//!
//! Implements [`Connector`] so a real [`RegistryClient`] can run against it.
//! Like a real server it keeps ephemeral state per connection: closing or
//! killing a connection forgets that connection's instances, subscriptions
//! and locks. Every request type is counted for assertions.
//!
//! [`RegistryClient`]: registry_client::RegistryClient

use registry_client::error::{BoxFuture, ClientError};
use registry_client::lock::{LockOperation, LockOperationRequest};
use registry_client::naming::messages::{
    BatchInstanceRequest, InstanceRequest, NotifySubscriberRequest, ServiceQueryRequest,
    SubscribeServiceRequest, DEREGISTER_INSTANCE,
};
use registry_client::naming::{Instance, ServiceSnapshot};
use registry_client::remote::messages::{ConnectResetRequest, ConnectionSetupRequest, SetupAckRequest};
use registry_client::remote::payload::{decode, encode, encode_as, response_type_for};
use registry_client::remote::{Connector, Payload, RemoteMessage, RpcConnection, ServerCheckInfo};
use registry_client::security::{AccessToken, Authenticator};
use registry_client::server_list::ServerEndpoint;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Login that always refuses. Only reached when credentials are configured.
pub struct NoLogin;

impl Authenticator for NoLogin {
    fn login<'a>(&'a self, _server: &'a str, _user: &'a str, _pass: &'a str) -> BoxFuture<'a, AccessToken> {
        Box::pin(async { Err(ClientError::AuthDenied("login not supported by mock".into())) })
    }
}

// =============================================================================
// Server state
// =============================================================================

#[derive(Default)]
struct ServerState {
    /// `group@@service` → connection id → instances.
    instances: HashMap<String, HashMap<String, Vec<Instance>>>,
    /// Subscribed service keys per connection.
    subscriptions: HashMap<String, HashSet<String>>,
    /// Lock key → owning connection id.
    locks: HashMap<String, String>,
    /// Request counters, keyed by type (and operation for instance requests).
    requests: HashMap<String, usize>,
    /// Acks the client sent for server pushes.
    acks: Vec<String>,
}

impl ServerState {
    fn count(&mut self, kind: impl Into<String>) {
        *self.requests.entry(kind.into()).or_default() += 1;
    }

    fn forget(&mut self, connection_id: &str) {
        for per_conn in self.instances.values_mut() {
            per_conn.remove(connection_id);
        }
        self.subscriptions.remove(connection_id);
        self.locks.retain(|_, owner| owner != connection_id);
    }

    fn hosts(&self, service_key: &str) -> Vec<Instance> {
        let mut hosts: Vec<Instance> = self
            .instances
            .get(service_key)
            .map(|per_conn| per_conn.values().flatten().cloned().collect())
            .unwrap_or_default();
        hosts.sort_by_key(|h| h.key());
        hosts
    }
}

struct Shared {
    state: StdMutex<ServerState>,
    clock: AtomicI64,
}

impl Shared {
    fn view(&self, service: &str, group: &str, clusters: &str) -> ServiceSnapshot {
        let key = format!("{}@@{}", group, service);
        let hosts = self.state.lock().unwrap().hosts(&key);
        let mut snapshot = ServiceSnapshot::new(service, group, hosts, self.clock.fetch_add(1, Ordering::SeqCst));
        snapshot.clusters = clusters.to_string();
        snapshot
    }
}

// =============================================================================
// MockServer
// =============================================================================

/// Accepts connections and answers the client's requests.
pub struct MockServer {
    shared: Arc<Shared>,
    available: AtomicBool,
    refused: StdMutex<HashSet<String>>,
    negotiation: bool,
    connects: AtomicUsize,
    next_id: AtomicUsize,
    live: StdMutex<Vec<Arc<MockConnection>>>,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    /// A server that answers the setup with an ability table.
    pub fn with_negotiation() -> Arc<Self> {
        Self::build(true)
    }

    fn build(negotiation: bool) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                state: StdMutex::new(ServerState::default()),
                clock: AtomicI64::new(1_000),
            }),
            available: AtomicBool::new(true),
            refused: StdMutex::new(HashSet::new()),
            negotiation,
            connects: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
            live: StdMutex::new(Vec::new()),
        })
    }

    /// Refuse (or accept again) new connections.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Refuse connections to one configured address only.
    pub fn refuse(&self, address: &str) {
        self.refused.lock().unwrap().insert(address.to_string());
    }

    /// Drop every live connection, as a server restart would.
    pub fn kill_connections(&self) {
        let live: Vec<_> = self.live.lock().unwrap().drain(..).collect();
        for connection in live {
            connection.kill();
        }
    }

    /// Send a server push to every live connection.
    pub fn push(&self, payload: Payload) {
        for connection in self.live.lock().unwrap().iter() {
            connection.push(payload.clone());
        }
    }

    /// Push a fresh view of a service to every live connection.
    pub fn notify_subscribers(&self, service: &str, group: &str) {
        let view = self.shared.view(service, group, "");
        let request = NotifySubscriberRequest {
            request_id: Some(format!("push-{}", view.last_ref_time)),
            namespace: String::new(),
            service_name: service.to_string(),
            group_name: group.to_string(),
            service_info: view,
        };
        if let Ok(payload) = encode(&request, "") {
            self.push(payload);
        }
    }

    /// Ask every live connection to reconnect, optionally to `target`.
    pub fn request_reset(&self, target: Option<(&str, &str)>) {
        let (server_ip, server_port) = target
            .map(|(ip, port)| (Some(ip.to_string()), Some(port.to_string())))
            .unwrap_or((None, None));
        let request = ConnectResetRequest {
            request_id: Some("reset-1".into()),
            server_ip,
            server_port,
        };
        if let Ok(payload) = encode(&request, "") {
            self.push(payload);
        }
    }

    /// Register an instance as if another client owned it.
    pub fn register_external(&self, service: &str, group: &str, instance: Instance) {
        let key = format!("{}@@{}", group, service);
        self.shared
            .state
            .lock()
            .unwrap()
            .instances
            .entry(key)
            .or_default()
            .entry("external".into())
            .or_default()
            .push(instance);
    }

    /// Instances currently registered for a service, across connections.
    pub fn registered(&self, service: &str, group: &str) -> Vec<Instance> {
        self.shared.state.lock().unwrap().hosts(&format!("{}@@{}", group, service))
    }

    pub fn is_subscribed(&self, service_key: &str) -> bool {
        self.shared
            .state
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .any(|subs| subs.contains(service_key))
    }

    pub fn lock_owner(&self, key: &str) -> Option<String> {
        self.shared.state.lock().unwrap().locks.get(key).cloned()
    }

    /// Take `key` for a connection that is not the client's.
    pub fn hold_lock_externally(&self, key: &str) {
        self.shared
            .state
            .lock()
            .unwrap()
            .locks
            .insert(key.to_string(), "external".to_string());
    }

    /// How many requests of `kind` arrived, e.g. `"InstanceRequest:registerInstance"`.
    pub fn request_count(&self, kind: &str) -> usize {
        self.shared.state.lock().unwrap().requests.get(kind).copied().unwrap_or(0)
    }

    /// Push acks received, by response type.
    pub fn acks(&self) -> Vec<String> {
        self.shared.state.lock().unwrap().acks.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Server address of each live connection.
    pub fn connected_servers(&self) -> Vec<String> {
        self.live
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !c.closed.load(Ordering::SeqCst))
            .map(|c| c.server.clone())
            .collect()
    }

    pub fn live_connections(&self) -> usize {
        self.live
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !c.closed.load(Ordering::SeqCst))
            .count()
    }
}

impl Connector for MockServer {
    fn connect<'a>(&'a self, server: &'a ServerEndpoint) -> BoxFuture<'a, (Arc<dyn RpcConnection>, ServerCheckInfo)> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if !self.available.load(Ordering::SeqCst) || self.refused.lock().unwrap().contains(server.address()) {
                return Err(ClientError::transient(server.address(), "connection refused"));
            }
            let id = format!("conn-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            let connection = MockConnection::new(&id, server.address(), Arc::clone(&self.shared), self.negotiation);
            self.live.lock().unwrap().push(Arc::clone(&connection));
            let info = ServerCheckInfo {
                connection_id: id,
                support_ability_negotiation: self.negotiation,
            };
            Ok((connection as Arc<dyn RpcConnection>, info))
        })
    }
}

// =============================================================================
// MockConnection
// =============================================================================

pub struct MockConnection {
    id: String,
    server: String,
    shared: Arc<Shared>,
    negotiation: bool,
    push_tx: StdMutex<Option<mpsc::UnboundedSender<Payload>>>,
    pushes: Mutex<mpsc::UnboundedReceiver<Payload>>,
    closed: AtomicBool,
}

impl MockConnection {
    fn new(id: &str, server: &str, shared: Arc<Shared>, negotiation: bool) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: id.to_string(),
            server: server.to_string(),
            shared,
            negotiation,
            push_tx: StdMutex::new(Some(tx)),
            pushes: Mutex::new(rx),
            closed: AtomicBool::new(false),
        })
    }

    fn push(&self, payload: Payload) {
        if let Some(tx) = self.push_tx.lock().unwrap().as_ref() {
            let _ = tx.send(payload);
        }
    }

    /// Server side close: the stream ends and ephemeral state is dropped.
    fn kill(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.push_tx.lock().unwrap().take();
        self.shared.state.lock().unwrap().forget(&self.id);
    }

    fn answer(&self, payload: &Payload) -> Result<Value, ClientError> {
        let kind = payload.message_type().to_string();
        let mut state = self.shared.state.lock().unwrap();

        let body = match kind.as_str() {
            "HealthCheckRequest" => {
                state.count(&kind);
                json!({})
            }
            t if t == InstanceRequest::TYPE => {
                let request: InstanceRequest = decode(payload)?;
                state.count(format!("{}:{}", kind, request.operation));
                let key = format!("{}@@{}", request.group_name, request.service_name);
                let owned = state
                    .instances
                    .entry(key)
                    .or_default()
                    .entry(self.id.clone())
                    .or_default();
                owned.retain(|i| i.key() != request.instance.key());
                if request.operation != DEREGISTER_INSTANCE {
                    owned.push(request.instance);
                }
                json!({ "type": request.operation })
            }
            t if t == BatchInstanceRequest::TYPE => {
                let request: BatchInstanceRequest = decode(payload)?;
                state.count(format!("{}:{}", kind, request.operation));
                let key = format!("{}@@{}", request.group_name, request.service_name);
                state
                    .instances
                    .entry(key)
                    .or_default()
                    .insert(self.id.clone(), request.instances);
                json!({ "type": request.operation })
            }
            t if t == SubscribeServiceRequest::TYPE => {
                let request: SubscribeServiceRequest = decode(payload)?;
                state.count(format!("{}:{}", kind, request.subscribe));
                let service_key = format!("{}@@{}", request.group_name, request.service_name);
                let subs = state.subscriptions.entry(self.id.clone()).or_default();
                if request.subscribe {
                    subs.insert(service_key);
                } else {
                    subs.remove(&service_key);
                }
                drop(state);
                let view = self.shared.view(&request.service_name, &request.group_name, &request.clusters);
                json!({ "serviceInfo": view })
            }
            t if t == ServiceQueryRequest::TYPE => {
                let request: ServiceQueryRequest = decode(payload)?;
                state.count(&kind);
                drop(state);
                let view = self.shared.view(&request.service_name, &request.group_name, &request.cluster);
                json!({ "serviceInfo": view })
            }
            t if t == LockOperationRequest::TYPE => {
                let request: LockOperationRequest = decode(payload)?;
                let key = request.lock_instance.key;
                let result = match request.operation {
                    LockOperation::TryLock => {
                        state.count(format!("{}:tryLock", kind));
                        let free = state.locks.get(&key).map_or(true, |owner| owner == &self.id);
                        if free {
                            state.locks.insert(key, self.id.clone());
                        }
                        free
                    }
                    LockOperation::Release => {
                        state.count(format!("{}:release", kind));
                        if state.locks.get(&key) == Some(&self.id) {
                            state.locks.remove(&key);
                        }
                        true
                    }
                };
                json!({ "result": result })
            }
            "ConfigBatchListenRequest" => {
                let request: Value = decode(payload)?;
                let listen = request.get("listen").and_then(Value::as_bool).unwrap_or(true);
                state.count(format!("{}:{}", kind, listen));
                json!({ "changedConfigs": [] })
            }
            _ => {
                state.count(&kind);
                return Ok(json!({
                    "resultCode": 500,
                    "errorCode": 501,
                    "message": format!("unsupported request {}", kind),
                }));
            }
        };

        let mut body = body;
        if let Value::Object(map) = &mut body {
            map.insert("resultCode".into(), json!(200));
            map.insert("errorCode".into(), json!(0));
        }
        Ok(body)
    }
}

impl RpcConnection for MockConnection {
    fn connection_id(&self) -> &str {
        &self.id
    }

    fn server(&self) -> &str {
        &self.server
    }

    fn request<'a>(&'a self, payload: Payload, _timeout: Duration) -> BoxFuture<'a, Payload> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ClientError::transient(&self.server, "connection closed"));
            }
            let body = self.answer(&payload)?;
            encode_as(&response_type_for(payload.message_type()), &body, "")
        })
    }

    fn send<'a>(&'a self, payload: Payload) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ClientError::transient(&self.server, "connection closed"));
            }
            if payload.message_type() == ConnectionSetupRequest::TYPE {
                if self.negotiation {
                    let ack = SetupAckRequest {
                        request_id: Some(format!("ack-{}", self.id)),
                        ability_table: BTreeMap::from([("lockOperation".to_string(), true)]),
                    };
                    self.push(encode(&ack, "")?);
                }
            } else {
                self.shared
                    .state
                    .lock()
                    .unwrap()
                    .acks
                    .push(payload.message_type().to_string());
            }
            Ok(())
        })
    }

    fn next_push<'a>(&'a self) -> BoxFuture<'a, Option<Payload>> {
        Box::pin(async move { Ok(self.pushes.lock().await.recv().await) })
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.push_tx.lock().unwrap().take();
            self.shared.state.lock().unwrap().forget(&self.id);
        }
    }
}
