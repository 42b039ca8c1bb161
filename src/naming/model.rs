// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Naming data model: instances and service snapshots.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_GROUP: &str = "DEFAULT_GROUP";
pub const DEFAULT_CLUSTER: &str = "DEFAULT";

/// Separator between group and service name, and before the cluster list.
pub const KEY_SEPARATOR: &str = "@@";

const MAX_WEIGHT: f64 = 10_000.0;

/// One service instance. Identity is `ip:port`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    #[serde(default)]
    pub instance_id: Option<String>,
    pub ip: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_true")]
    pub healthy: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub ephemeral: bool,
    #[serde(default = "default_cluster")]
    pub cluster_name: String,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_weight() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_cluster() -> String {
    DEFAULT_CLUSTER.to_string()
}

impl Instance {
    /// Healthy, enabled, ephemeral instance with weight 1 in the default cluster.
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            instance_id: None,
            ip: ip.into(),
            port,
            weight: default_weight(),
            healthy: true,
            enabled: true,
            ephemeral: true,
            cluster_name: default_cluster(),
            service_name: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster_name = cluster.into();
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.ephemeral = false;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// `ip:port`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Reject instances the server would refuse anyway.
    pub fn validate(&self) -> Result<()> {
        if self.ip.trim().is_empty() {
            return Err(ClientError::InvalidInput("instance ip must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(ClientError::InvalidInput(format!("instance {} has port 0", self.ip)));
        }
        if !self.weight.is_finite() || self.weight < 0.0 || self.weight > MAX_WEIGHT {
            return Err(ClientError::InvalidInput(format!(
                "instance {} weight {} outside [0, {}]",
                self.key(),
                self.weight,
                MAX_WEIGHT
            )));
        }
        if !is_valid_cluster_name(&self.cluster_name) {
            return Err(ClientError::InvalidInput(format!(
                "instance {} has invalid cluster name {:?}",
                self.key(),
                self.cluster_name
            )));
        }
        Ok(())
    }
}

fn is_valid_cluster_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// `group@@service`.
pub fn grouped_name(service_name: &str, group_name: &str) -> String {
    format!("{}{}{}", group_name, KEY_SEPARATOR, service_name)
}

/// Cache key: `group@@service`, plus `@@clusters` when a cluster filter is set.
pub fn service_key(service_name: &str, group_name: &str, clusters: &str) -> String {
    let grouped = grouped_name(service_name, group_name);
    if clusters.is_empty() {
        grouped
    } else {
        format!("{}{}{}", grouped, KEY_SEPARATOR, clusters)
    }
}

/// Normalize a cluster filter: sorted, deduplicated, comma joined.
pub fn cluster_list(clusters: &[String]) -> String {
    let mut sorted: Vec<&str> = clusters.iter().map(|c| c.trim()).filter(|c| !c.is_empty()).collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.join(",")
}

/// The server's view of a service at `last_ref_time`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSnapshot {
    pub name: String,
    #[serde(default)]
    pub group_name: String,
    #[serde(default)]
    pub clusters: String,
    #[serde(default)]
    pub hosts: Vec<Instance>,
    /// Server timestamp (epoch millis) of this view.
    #[serde(default)]
    pub last_ref_time: i64,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub cache_millis: i64,
}

impl ServiceSnapshot {
    pub fn new(name: impl Into<String>, group_name: impl Into<String>, hosts: Vec<Instance>, last_ref_time: i64) -> Self {
        Self {
            name: name.into(),
            group_name: group_name.into(),
            clusters: String::new(),
            hosts,
            last_ref_time,
            checksum: String::new(),
            cache_millis: 10_000,
        }
    }

    pub fn key(&self) -> String {
        service_key(&self.name, &self.group_name, &self.clusters)
    }

    /// Instances the caller may route to.
    pub fn healthy_hosts(&self) -> Vec<Instance> {
        self.hosts
            .iter()
            .filter(|h| h.healthy && h.enabled && h.weight > 0.0)
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_json_shape() {
        let instance = Instance::new("10.0.0.1", 8080).with_metadata("zone", "a");
        let json = serde_json::to_string(&instance).unwrap();
        assert!(json.contains("\"clusterName\":\"DEFAULT\""));
        assert!(json.contains("\"ephemeral\":true"));

        let parsed: Instance = serde_json::from_str(r#"{"ip":"10.0.0.2","port":80}"#).unwrap();
        assert_eq!(parsed.weight, 1.0);
        assert!(parsed.healthy && parsed.enabled && parsed.ephemeral);
        assert_eq!(parsed.key(), "10.0.0.2:80");
    }

    #[test]
    fn test_validate() {
        assert!(Instance::new("10.0.0.1", 80).validate().is_ok());
        assert!(Instance::new("", 80).validate().is_err());
        assert!(Instance::new("10.0.0.1", 0).validate().is_err());
        assert!(Instance::new("10.0.0.1", 80).with_weight(-1.0).validate().is_err());
        assert!(Instance::new("10.0.0.1", 80).with_weight(f64::NAN).validate().is_err());
        assert!(Instance::new("10.0.0.1", 80).with_cluster("bad cluster").validate().is_err());
        assert!(Instance::new("10.0.0.1", 80).with_cluster("zone-a_1").validate().is_ok());
    }

    #[test]
    fn test_service_keys() {
        assert_eq!(grouped_name("orders", DEFAULT_GROUP), "DEFAULT_GROUP@@orders");
        assert_eq!(service_key("orders", "g", ""), "g@@orders");
        assert_eq!(service_key("orders", "g", "a,b"), "g@@orders@@a,b");
        assert_eq!(cluster_list(&["b".into(), "a".into(), "b".into(), " ".into()]), "a,b");
    }

    #[test]
    fn test_healthy_hosts_filters() {
        let mut down = Instance::new("10.0.0.2", 80);
        down.healthy = false;
        let zero = Instance::new("10.0.0.3", 80).with_weight(0.0);
        let snapshot = ServiceSnapshot::new("orders", "g", vec![Instance::new("10.0.0.1", 80), down, zero], 1);
        let healthy = snapshot.healthy_hosts();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].ip, "10.0.0.1");
    }
}
