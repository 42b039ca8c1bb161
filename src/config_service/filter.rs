// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Content filters and parsers.
//!
//! Filters see every published item before it is sent and every fetched item
//! before it is returned, in ascending `order()`. Typical uses are
//! encryption and decryption. Parsers turn content into a flat key/value map.

use super::model::{content_checksum, ConfigSnapshot};
use crate::error::{ClientError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Where a filter runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPhase {
    /// Before content is sent to the server.
    Publish,
    /// After content is received (or read from failover/snapshot data).
    Get,
}

pub trait ConfigFilter: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs first.
    fn order(&self) -> i32 {
        0
    }

    fn filter(&self, phase: ConfigPhase, config: &mut ConfigSnapshot) -> Result<()>;
}

#[derive(Default, Clone)]
pub struct ConfigFilterChain {
    filters: Vec<Arc<dyn ConfigFilter>>,
}

impl ConfigFilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, filter: Arc<dyn ConfigFilter>) {
        self.filters.push(filter);
        self.filters.sort_by_key(|f| f.order());
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run every filter in order. The checksum is recomputed afterwards.
    pub fn apply(&self, phase: ConfigPhase, config: &mut ConfigSnapshot) -> Result<()> {
        if self.filters.is_empty() {
            return Ok(());
        }
        for filter in &self.filters {
            filter.filter(phase, config)?;
            debug!(filter = filter.name(), ?phase, key = %config.key(), "Config filter applied");
        }
        config.checksum = content_checksum(&config.content);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Parsers
// ═══════════════════════════════════════════════════════════════════════════════

pub trait ConfigParser: Send + Sync {
    fn parse(&self, content: &str) -> Result<BTreeMap<String, String>>;
}

/// `key=value` / `key: value` lines; `#` and `!` start comments.
#[derive(Debug, Default, Clone, Copy)]
pub struct PropertiesParser;

impl ConfigParser for PropertiesParser {
    fn parse(&self, content: &str) -> Result<BTreeMap<String, String>> {
        let mut map = BTreeMap::new();
        for (n, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let split = line.find(['=', ':']).ok_or_else(|| {
                ClientError::InvalidInput(format!("line {}: expected key=value, got {:?}", n + 1, line))
            })?;
            let key = line[..split].trim();
            if key.is_empty() {
                return Err(ClientError::InvalidInput(format!("line {}: empty key", n + 1)));
            }
            map.insert(key.to_string(), line[split + 1..].trim().to_string());
        }
        Ok(map)
    }
}

/// A JSON object, flattened with `.`-joined keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonParser;

impl ConfigParser for JsonParser {
    fn parse(&self, content: &str) -> Result<BTreeMap<String, String>> {
        let value: serde_json::Value = serde_json::from_str(content)?;
        if !value.is_object() {
            return Err(ClientError::InvalidInput("JSON config must be an object".to_string()));
        }
        let mut map = BTreeMap::new();
        flatten("", &value, &mut map);
        Ok(map)
    }
}

fn flatten(prefix: &str, value: &serde_json::Value, out: &mut BTreeMap<String, String>) {
    match value {
        serde_json::Value::Object(fields) => {
            for (k, v) in fields {
                let key = if prefix.is_empty() { k.clone() } else { format!("{}.{}", prefix, k) };
                flatten(&key, v, out);
            }
        }
        serde_json::Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}
