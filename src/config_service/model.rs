// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const DEFAULT_CONFIG_GROUP: &str = "DEFAULT_GROUP";

/// One configuration item as last seen from the server (or a snapshot).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    pub data_id: String,
    pub group: String,
    #[serde(default)]
    pub tenant: String,
    pub content: String,
    #[serde(default)]
    pub content_type: Option<String>,
    /// SHA-256 of `content`, hex.
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub encrypted_data_key: Option<String>,
    #[serde(default)]
    pub last_modified: i64,
}

impl ConfigSnapshot {
    pub fn new(data_id: &str, group: &str, tenant: &str, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            data_id: data_id.to_string(),
            group: group.to_string(),
            tenant: tenant.to_string(),
            checksum: content_checksum(&content),
            content,
            content_type: None,
            encrypted_data_key: None,
            last_modified: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn key(&self) -> String {
        crate::redo::config_key(&self.data_id, &self.group, &self.tenant)
    }
}

pub fn content_checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_computes_checksum() {
        let a = ConfigSnapshot::new("app.yaml", DEFAULT_CONFIG_GROUP, "", "x: 1");
        let b = ConfigSnapshot::new("app.yaml", DEFAULT_CONFIG_GROUP, "", "x: 2");
        assert_eq!(a.checksum.len(), 64);
        assert_ne!(a.checksum, b.checksum);
        assert_eq!(a.key(), "app.yaml+DEFAULT_GROUP");
    }
}
