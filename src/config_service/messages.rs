// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use crate::remote::RemoteMessage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigListenContext {
    pub data_id: String,
    pub group: String,
    #[serde(default)]
    pub tenant: String,
    /// Checksum of the content the client holds; empty when it holds none.
    #[serde(default)]
    pub md5: String,
}

/// Start (`listen: true`) or stop watching a set of items.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigBatchListenRequest {
    pub request_id: String,
    pub listen: bool,
    pub config_listen_contexts: Vec<ConfigListenContext>,
}

impl RemoteMessage for ConfigBatchListenRequest {
    const TYPE: &'static str = "ConfigBatchListenRequest";
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangedConfig {
    pub data_id: String,
    pub group: String,
    #[serde(default)]
    pub tenant: String,
}

/// Body of `ConfigChangeBatchListenResponse`: items whose content differs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigChangeBatchListenBody {
    #[serde(default)]
    pub changed_configs: Vec<ChangedConfig>,
}

/// Server push: an item this client listens to has changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigChangeNotifyRequest {
    #[serde(default)]
    pub request_id: Option<String>,
    pub data_id: String,
    pub group: String,
    #[serde(default)]
    pub tenant: String,
}

impl RemoteMessage for ConfigChangeNotifyRequest {
    const TYPE: &'static str = "ConfigChangeNotifyRequest";
}
