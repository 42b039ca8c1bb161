// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Naming request and response bodies.

use super::model::{Instance, ServiceSnapshot};
use crate::remote::RemoteMessage;
use serde::{Deserialize, Serialize};

pub const REGISTER_INSTANCE: &str = "registerInstance";
pub const DEREGISTER_INSTANCE: &str = "deRegisterInstance";
pub const BATCH_REGISTER_INSTANCE: &str = "batchRegisterInstance";

/// Register or deregister one ephemeral instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRequest {
    pub request_id: String,
    pub namespace: String,
    pub service_name: String,
    pub group_name: String,
    #[serde(rename = "type")]
    pub operation: String,
    pub instance: Instance,
}

impl RemoteMessage for InstanceRequest {
    const TYPE: &'static str = "InstanceRequest";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchInstanceRequest {
    pub request_id: String,
    pub namespace: String,
    pub service_name: String,
    pub group_name: String,
    #[serde(rename = "type")]
    pub operation: String,
    pub instances: Vec<Instance>,
}

impl RemoteMessage for BatchInstanceRequest {
    const TYPE: &'static str = "BatchInstanceRequest";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeServiceRequest {
    pub request_id: String,
    pub namespace: String,
    pub service_name: String,
    pub group_name: String,
    pub clusters: String,
    pub subscribe: bool,
}

impl RemoteMessage for SubscribeServiceRequest {
    const TYPE: &'static str = "SubscribeServiceRequest";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceQueryRequest {
    pub request_id: String,
    pub namespace: String,
    pub service_name: String,
    pub group_name: String,
    pub cluster: String,
    pub healthy_only: bool,
    #[serde(default)]
    pub udp_port: u16,
}

impl RemoteMessage for ServiceQueryRequest {
    const TYPE: &'static str = "ServiceQueryRequest";
}

/// Body of `SubscribeServiceResponse` and `QueryServiceResponse`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfoBody {
    #[serde(default)]
    pub service_info: Option<ServiceSnapshot>,
}

/// Server push with a fresh service view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifySubscriberRequest {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub group_name: String,
    pub service_info: ServiceSnapshot,
}

impl RemoteMessage for NotifySubscriberRequest {
    const TYPE: &'static str = "NotifySubscriberRequest";
}
