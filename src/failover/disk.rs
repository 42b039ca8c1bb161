// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable snapshot files.
//!
//! # Layout
//!
//! ```text
//! <root>/
//! ├── failover.switch                 # "1" / "true" / "on" enables failover
//! ├── naming/<tenant>/<key>.json
//! └── config/<tenant>/<key>.json
//! ```
//!
//! Keys are escaped so that any byte outside `[A-Za-z0-9._-]` becomes `%XX`.
//!
//! # File Format
//!
//! ```json
//! {
//!   "kind": "naming",
//!   "tenant": "public",
//!   "key": "DEFAULT_GROUP@@orders",
//!   "payload": { ... },
//!   "checksum": "<sha256 hex of the canonical payload JSON>",
//!   "lastModified": 1735689600000
//! }
//! ```
//!
//! Writes go to a temp file that is renamed into place. A file that does not
//! parse, or whose checksum does not match its payload, reads as "no data".

use super::{FailoverDataSource, FailoverEntry, FailoverKind, FailoverPayload};
use crate::error::{BoxFuture, ClientError, Result};
use crate::metrics;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Name of the switch file under the failover root.
pub const SWITCH_FILE: &str = "failover.switch";

const SNAPSHOT_EXTENSION: &str = "json";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotFile {
    kind: FailoverKind,
    tenant: String,
    key: String,
    payload: serde_json::Value,
    checksum: String,
    last_modified: i64,
}

fn payload_checksum(payload: &serde_json::Value) -> Result<String> {
    // serde_json::Value objects are key-sorted, so this is canonical.
    let bytes = serde_json::to_vec(payload)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Escape a key into a file name.
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    // "." and ".." are not usable file names
    if out.chars().all(|c| c == '.') {
        out = out.replace('.', "%2E");
    }
    out
}

/// Parse one snapshot file. Fails on malformed JSON, an unknown payload shape
/// or a checksum mismatch.
pub fn parse_snapshot(bytes: &[u8]) -> Result<(String, FailoverEntry)> {
    let file: SnapshotFile = serde_json::from_slice(bytes)?;
    let expected = payload_checksum(&file.payload)?;
    if expected != file.checksum {
        return Err(ClientError::Internal(format!(
            "checksum mismatch for {}: stored {}, computed {}",
            file.key, file.checksum, expected
        )));
    }
    let payload = match file.kind {
        FailoverKind::Naming => FailoverPayload::Naming(serde_json::from_value(file.payload)?),
        FailoverKind::Config => FailoverPayload::Config(serde_json::from_value(file.payload)?),
    };
    Ok((
        file.tenant,
        FailoverEntry {
            key: file.key,
            payload,
        },
    ))
}

fn render_snapshot(tenant: &str, entry: &FailoverEntry) -> Result<Vec<u8>> {
    let payload = match &entry.payload {
        FailoverPayload::Naming(s) => serde_json::to_value(s)?,
        FailoverPayload::Config(c) => serde_json::to_value(c)?,
    };
    let file = SnapshotFile {
        kind: entry.kind(),
        tenant: tenant.to_string(),
        key: entry.key.clone(),
        checksum: payload_checksum(&payload)?,
        payload,
        last_modified: chrono::Utc::now().timestamp_millis(),
    };
    Ok(serde_json::to_vec_pretty(&file)?)
}

/// Snapshot files for one tenant under one root.
///
/// All reads and writes through a store serialize on one async mutex.
#[derive(Debug)]
pub struct SnapshotStore {
    root: PathBuf,
    tenant: String,
    lock: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>, tenant: &str) -> Self {
        Self {
            root: root.into(),
            tenant: tenant.to_string(),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_for(&self, kind: FailoverKind) -> PathBuf {
        self.root.join(kind.as_str()).join(encode_key(&self.tenant))
    }

    pub fn path_for(&self, kind: FailoverKind, key: &str) -> PathBuf {
        self.dir_for(kind)
            .join(format!("{}.{}", encode_key(key), SNAPSHOT_EXTENSION))
    }

    /// Atomically write (or replace) the file for `entry`.
    pub async fn write(&self, entry: &FailoverEntry) -> Result<()> {
        let kind = entry.kind();
        let result = self.write_inner(entry).await;
        metrics::record_snapshot_write(kind.as_str(), result.is_ok());
        result
    }

    async fn write_inner(&self, entry: &FailoverEntry) -> Result<()> {
        let bytes = render_snapshot(&self.tenant, entry)?;
        let dir = self.dir_for(entry.kind());
        let path = self.path_for(entry.kind(), &entry.key);
        let tmp = path.with_extension(format!("{}.tmp", SNAPSHOT_EXTENSION));

        let _guard = self.lock.lock().await;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ClientError::snapshot(&dir, e))?;
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| ClientError::snapshot(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| ClientError::snapshot(&path, e))?;
        debug!(path = %path.display(), "Snapshot written");
        Ok(())
    }

    /// Read one entry. Missing, unreadable and corrupt files all read as `None`.
    pub async fn read(&self, kind: FailoverKind, key: &str) -> Option<FailoverEntry> {
        let path = self.path_for(kind, key);
        let _guard = self.lock.lock().await;
        Self::read_file(kind, &path).await
    }

    async fn read_file(kind: FailoverKind, path: &Path) -> Option<FailoverEntry> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Snapshot unreadable");
                return None;
            }
        };
        match parse_snapshot(&bytes) {
            Ok((_, entry)) if entry.kind() == kind => Some(entry),
            Ok(_) => {
                warn!(path = %path.display(), "Snapshot kind does not match its directory");
                metrics::record_snapshot_corrupt(kind.as_str());
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt snapshot ignored");
                metrics::record_snapshot_corrupt(kind.as_str());
                None
            }
        }
    }

    /// Every readable entry of `kind`. Corrupt files are skipped.
    pub async fn read_all(&self, kind: FailoverKind) -> Result<Vec<FailoverEntry>> {
        let dir = self.dir_for(kind);
        let _guard = self.lock.lock().await;

        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ClientError::snapshot(&dir, e)),
        };

        let mut entries = Vec::new();
        while let Some(item) = reader
            .next_entry()
            .await
            .map_err(|e| ClientError::snapshot(&dir, e))?
        {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXTENSION) {
                continue;
            }
            if let Some(entry) = Self::read_file(kind, &path).await {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub async fn remove(&self, kind: FailoverKind, key: &str) -> Result<()> {
        let path = self.path_for(kind, key);
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ClientError::snapshot(&path, e)),
        }
    }
}

/// Failover data read from a directory written by operators (or by
/// [`SnapshotStore::write`]), gated by [`SWITCH_FILE`].
#[derive(Debug)]
pub struct DiskFailoverDataSource {
    store: SnapshotStore,
}

impl DiskFailoverDataSource {
    pub fn new(root: impl Into<PathBuf>, tenant: &str) -> Self {
        Self {
            store: SnapshotStore::new(root, tenant),
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn switch_path(&self) -> PathBuf {
        self.store.root().join(SWITCH_FILE)
    }
}

/// `1`, `true` or `on` (case-insensitive, surrounding whitespace ignored).
pub fn parse_switch(content: &str) -> bool {
    matches!(content.trim().to_ascii_lowercase().as_str(), "1" | "true" | "on")
}

impl FailoverDataSource for DiskFailoverDataSource {
    fn get_switch<'a>(&'a self) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let path = self.switch_path();
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => Ok(parse_switch(&content)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(ClientError::snapshot(&path, e)),
            }
        })
    }

    fn get_failover_data<'a>(&'a self) -> BoxFuture<'a, Vec<FailoverEntry>> {
        Box::pin(async move {
            let mut entries = self.store.read_all(FailoverKind::Naming).await?;
            entries.extend(self.store.read_all(FailoverKind::Config).await?);
            Ok(entries)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_service::ConfigSnapshot;
    use crate::naming::model::{Instance, ServiceSnapshot};
    use tempfile::TempDir;

    fn service_entry() -> FailoverEntry {
        FailoverEntry::naming(ServiceSnapshot::new(
            "orders",
            "DEFAULT_GROUP",
            vec![Instance::new("10.0.0.1", 8080)],
            42,
        ))
    }

    #[test]
    fn test_encode_key() {
        assert_eq!(encode_key("DEFAULT_GROUP@@orders"), "DEFAULT_GROUP%40%40orders");
        assert_eq!(encode_key("a/b"), "a%2Fb");
        assert_eq!(encode_key(".."), "%2E%2E");
        assert_eq!(encode_key("app.yaml+g"), "app.yaml%2Bg");
    }

    #[test]
    fn test_parse_switch() {
        for on in ["1", "true", "ON", " on\n"] {
            assert!(parse_switch(on), "{on:?}");
        }
        for off in ["0", "false", "", "yes"] {
            assert!(!parse_switch(off), "{off:?}");
        }
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), "public");
        let entry = service_entry();
        store.write(&entry).await.unwrap();

        let path = store.path_for(FailoverKind::Naming, &entry.key);
        assert!(path.starts_with(dir.path().join("naming").join("public")));
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let read = store.read(FailoverKind::Naming, &entry.key).await.unwrap();
        assert_eq!(read, entry);
        assert!(store.read(FailoverKind::Config, &entry.key).await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_and_tampered_files_read_as_none() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), "public");
        let entry = service_entry();
        store.write(&entry).await.unwrap();
        let path = store.path_for(FailoverKind::Naming, &entry.key);

        // Tamper with the payload but keep valid JSON
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("10.0.0.1", "10.0.0.9")).unwrap();
        assert!(store.read(FailoverKind::Naming, &entry.key).await.is_none());

        std::fs::write(&path, b"{ not json").unwrap();
        assert!(store.read(FailoverKind::Naming, &entry.key).await.is_none());
        assert!(store.read_all(FailoverKind::Naming).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_all_skips_foreign_files() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), "public");
        store.write(&service_entry()).await.unwrap();
        let naming_dir = dir.path().join("naming").join("public");
        std::fs::write(naming_dir.join("README.txt"), "ignore me").unwrap();
        std::fs::write(naming_dir.join("broken.json"), "[]").unwrap();

        let all = store.read_all(FailoverKind::Naming).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(store.read_all(FailoverKind::Config).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), "public");
        let entry = service_entry();
        store.write(&entry).await.unwrap();
        store.remove(FailoverKind::Naming, &entry.key).await.unwrap();
        store.remove(FailoverKind::Naming, &entry.key).await.unwrap();
        assert!(store.read(FailoverKind::Naming, &entry.key).await.is_none());
    }

    #[tokio::test]
    async fn test_disk_source_switch_and_data() {
        let dir = TempDir::new().unwrap();
        let source = DiskFailoverDataSource::new(dir.path(), "public");
        assert!(!source.get_switch().await.unwrap());

        std::fs::write(source.switch_path(), "true").unwrap();
        assert!(source.get_switch().await.unwrap());

        source.store().write(&service_entry()).await.unwrap();
        source
            .store()
            .write(&FailoverEntry::config(ConfigSnapshot::new("app.yaml", "DEFAULT_GROUP", "", "x: 1")))
            .await
            .unwrap();
        let data = source.get_failover_data().await.unwrap();
        assert_eq!(data.len(), 2);
    }
}
