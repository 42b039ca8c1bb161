// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection-level message bodies (handshake, keepalive, server control).

use super::payload::RemoteMessage;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Ability keys this client announces during setup.
pub const CLIENT_ABILITIES: &[&str] = &[
    "supportPersistentInstanceByGrpc",
    "lockOperation",
];

/// Unary check sent before the stream is opened; returns the connection id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCheckRequest {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl RemoteMessage for ServerCheckRequest {
    const TYPE: &'static str = "ServerCheckRequest";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCheckResponse {
    #[serde(default)]
    pub connection_id: String,
    #[serde(default)]
    pub support_ability_negotiation: bool,
}

/// First message on the bi-directional stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSetupRequest {
    pub client_version: String,
    #[serde(default)]
    pub tenant: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub ability_table: BTreeMap<String, bool>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl RemoteMessage for ConnectionSetupRequest {
    const TYPE: &'static str = "ConnectionSetupRequest";
}

impl ConnectionSetupRequest {
    /// Setup request announcing [`CLIENT_ABILITIES`].
    pub fn new(client_version: &str, tenant: &str, labels: BTreeMap<String, String>) -> Self {
        Self {
            client_version: client_version.to_string(),
            tenant: tenant.to_string(),
            labels,
            ability_table: CLIENT_ABILITIES.iter().map(|a| (a.to_string(), true)).collect(),
            headers: HashMap::new(),
        }
    }
}

/// Server push carrying the negotiated server ability table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupAckRequest {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub ability_table: BTreeMap<String, bool>,
}

impl RemoteMessage for SetupAckRequest {
    const TYPE: &'static str = "SetupAckRequest";
}

/// Server asks the client to move to another server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResetRequest {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub server_ip: Option<String>,
    #[serde(default)]
    pub server_port: Option<String>,
}

impl RemoteMessage for ConnectResetRequest {
    const TYPE: &'static str = "ConnectResetRequest";
}

impl ConnectResetRequest {
    /// `host:port` the server suggests, if it named one.
    pub fn target(&self) -> Option<String> {
        match (self.server_ip.as_deref(), self.server_port.as_deref()) {
            (Some(ip), Some(port)) if !ip.is_empty() && !port.is_empty() => Some(format!("{}:{}", ip, port)),
            _ => None,
        }
    }
}

/// Client keepalive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckRequest {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl RemoteMessage for HealthCheckRequest {
    const TYPE: &'static str = "HealthCheckRequest";
}

/// Server-side liveness check of the client; answered with the default ack.
pub const CLIENT_DETECTION_REQUEST: &str = "ClientDetectionRequest";
