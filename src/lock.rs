// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Distributed lock facade.
//!
//! A lock acquired through this proxy is recorded in the lock redo registry,
//! so it is taken again after a reconnect. An answer of "held elsewhere"
//! drops the intent. A connectivity failure keeps it queued and `lock()`
//! reports `Ok(false)`; [`LockProxy::is_held`] turns true once the redo
//! worker acquires it.

use crate::error::{ClientError, Result};
use crate::redo::{LockRedo, RedoService};
use crate::remote::payload::next_request_id;
use crate::remote::{ConnectionManager, RemoteMessage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const LOCK_TYPE: &str = "NACOS_LOCK";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockOperation {
    TryLock,
    Release,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInstance {
    pub key: String,
    /// Lease in millis; negative means no expiry.
    pub expired_time: i64,
    pub lock_type: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockOperationRequest {
    pub request_id: String,
    pub lock_instance: LockInstance,
    #[serde(rename = "lockOperationEnum")]
    pub operation: LockOperation,
}

impl RemoteMessage for LockOperationRequest {
    const TYPE: &'static str = "LockOperationRequest";
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LockOperationBody {
    #[serde(default)]
    result: bool,
}

pub struct LockProxy {
    connection: Arc<ConnectionManager>,
    redo: Arc<RedoService>,
}

impl LockProxy {
    pub fn new(connection: Arc<ConnectionManager>, redo: Arc<RedoService>) -> Self {
        Self { connection, redo }
    }

    /// Try to take `key` for `expire_ms` milliseconds (negative: no expiry).
    ///
    /// `Ok(false)` means the lock is not held yet: either another client
    /// holds it, or the server was unreachable and the request is queued.
    /// Only invalid input and definitive server rejections are errors.
    pub async fn lock(&self, key: &str, expire_ms: i64) -> Result<bool> {
        validate_key(key)?;
        let data = LockRedo {
            key: key.to_string(),
            expire_ms,
        };
        self.redo.locks().cache_for_redo(key, data.clone());

        match self.do_lock(&data).await {
            Ok(true) => {
                self.redo.locks().mark_registered(key);
                info!(key, expire_ms, "Lock acquired");
                Ok(true)
            }
            Ok(false) => {
                self.redo.locks().remove(key);
                debug!(key, "Lock held elsewhere");
                Ok(false)
            }
            Err(e) if e.is_connectivity() => {
                warn!(key, error = %e, "Lock deferred to redo");
                Ok(false)
            }
            Err(e) => {
                self.redo.locks().remove(key);
                Err(e)
            }
        }
    }

    /// Release `key`. `Ok(false)` means the server did not hold it for us.
    pub async fn unlock(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let data = match self.redo.locks().get(key) {
            Some(entry) => entry.data,
            None => LockRedo {
                key: key.to_string(),
                expire_ms: -1,
            },
        };
        let confirmed = self.redo.locks().is_registered(key);
        self.redo.locks().mark_unregistering(key);

        match self.do_unlock(&data).await {
            Ok(released) => {
                self.redo.locks().mark_unregistered(key);
                self.redo.locks().remove_if_unwound(key);
                info!(key, released, "Lock released");
                Ok(released)
            }
            Err(e) if e.is_connectivity() && confirmed => {
                warn!(key, error = %e, "Unlock deferred to redo");
                Err(e)
            }
            Err(e) => {
                self.redo.locks().remove(key);
                Err(e)
            }
        }
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.redo.locks().is_registered(key)
    }

    pub(crate) async fn do_lock(&self, data: &LockRedo) -> Result<bool> {
        self.send(data, LockOperation::TryLock).await
    }

    pub(crate) async fn do_unlock(&self, data: &LockRedo) -> Result<bool> {
        self.send(data, LockOperation::Release).await
    }

    async fn send(&self, data: &LockRedo, operation: LockOperation) -> Result<bool> {
        let request = LockOperationRequest {
            request_id: next_request_id(),
            lock_instance: LockInstance {
                key: data.key.clone(),
                expired_time: data.expire_ms,
                lock_type: LOCK_TYPE.to_string(),
                params: BTreeMap::new(),
            },
            operation,
        };
        let body: LockOperationBody = self.connection.request_typed(&request).await?;
        Ok(body.result)
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(ClientError::InvalidInput("lock key must not be empty".to_string()));
    }
    Ok(())
}
