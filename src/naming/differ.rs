// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Instance-level diff between two service snapshots.
//!
//! ```text
//! old absent                          -> every new host is "added"
//! old.last_ref_time > new + tolerance -> empty diff (stale push)
//! otherwise, keyed by ip:port:
//!   only in new  -> added
//!   only in old  -> removed
//!   in both, !=  -> modified (new version reported)
//! ```

use super::model::{Instance, ServiceSnapshot};
use std::collections::{HashMap, HashSet};

/// What changed between two snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstancesDiff {
    pub added: Vec<Instance>,
    pub removed: Vec<Instance>,
    pub modified: Vec<Instance>,
}

impl InstancesDiff {
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty())
    }
}

/// Computes [`InstancesDiff`]s, ignoring pushes older than the cached view.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstancesDiffer {
    /// Allowed clock skew (millis) before an older push counts as stale.
    stale_tolerance_ms: i64,
}

impl InstancesDiffer {
    pub fn new(stale_tolerance_ms: i64) -> Self {
        Self {
            stale_tolerance_ms: stale_tolerance_ms.max(0),
        }
    }

    /// `new` is older than `old` beyond the tolerance.
    pub fn is_stale(&self, old: &ServiceSnapshot, new: &ServiceSnapshot) -> bool {
        old.last_ref_time > new.last_ref_time.saturating_add(self.stale_tolerance_ms)
    }

    pub fn diff(&self, old: Option<&ServiceSnapshot>, new: &ServiceSnapshot) -> InstancesDiff {
        let Some(old) = old else {
            return InstancesDiff {
                added: new.hosts.clone(),
                ..Default::default()
            };
        };
        if self.is_stale(old, new) {
            return InstancesDiff::default();
        }

        let old_by_key: HashMap<String, &Instance> = old.hosts.iter().map(|h| (h.key(), h)).collect();
        let new_keys: HashSet<String> = new.hosts.iter().map(Instance::key).collect();

        let mut diff = InstancesDiff::default();
        let mut seen = HashSet::new();
        for host in &new.hosts {
            let key = host.key();
            if !seen.insert(key.clone()) {
                continue;
            }
            match old_by_key.get(&key) {
                None => diff.added.push(host.clone()),
                Some(previous) if *previous != host => diff.modified.push(host.clone()),
                Some(_) => {}
            }
        }

        let mut seen_removed = HashSet::new();
        for host in &old.hosts {
            let key = host.key();
            if !new_keys.contains(&key) && seen_removed.insert(key) {
                diff.removed.push(host.clone());
            }
        }
        diff
    }
}
