// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Server list and advisory health tracking.
//!
//! The client knows a fixed (but refreshable) list of server addresses.
//! Each [`ServerEndpoint`] carries a health flag that request outcomes flip;
//! health is advisory only and never removes a server from rotation for good.
//!
//! # Selection
//!
//! [`ServerListManager::get_next_server()`] walks the healthy servers in
//! round-robin order. When every server is unhealthy it walks the full list,
//! so a cluster that comes back is rediscovered without operator help.

use crate::error::{ClientError, Result};
use crate::metrics;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Default HTTP port when an address has none.
pub const DEFAULT_SERVER_PORT: u16 = 8848;

/// Current time in milliseconds since the Unix epoch.
pub(crate) fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One server address plus its advisory health.
#[derive(Debug)]
pub struct ServerEndpoint {
    address: String,
    host: String,
    port: u16,
    healthy: AtomicBool,
    /// Epoch millis of the last success, 0 if never.
    last_success: AtomicU64,
    /// Epoch millis of the last failure, 0 if never.
    last_failure: AtomicU64,
}

/// `host:port`, bracketing IPv6 hosts.
fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

impl ServerEndpoint {
    /// Parse `host:port` (or bare `host`, defaulting the port).
    ///
    /// IPv6 hosts must be bracketed (`[::1]:8848` or `[::1]`); `host()`
    /// returns them without brackets. A leading `http://` or `https://` is
    /// tolerated and stripped.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let without_scheme = trimmed
            .strip_prefix("http://")
            .or_else(|| trimmed.strip_prefix("https://"))
            .unwrap_or(trimmed)
            .trim_end_matches('/');

        if without_scheme.is_empty() {
            return Err(ClientError::Config(format!("invalid server address {:?}", raw)));
        }

        let parse_port = |port: &str| {
            port.parse::<u16>()
                .map_err(|_| ClientError::Config(format!("invalid port in server address {:?}", raw)))
        };

        let (host, port) = if let Some(bracketed) = without_scheme.strip_prefix('[') {
            let (host, rest) = bracketed
                .split_once(']')
                .ok_or_else(|| ClientError::Config(format!("unclosed bracket in server address {:?}", raw)))?;
            let port = match rest {
                "" => DEFAULT_SERVER_PORT,
                _ => match rest.strip_prefix(':') {
                    Some(port) => parse_port(port)?,
                    None => return Err(ClientError::Config(format!("invalid server address {:?}", raw))),
                },
            };
            (host.to_string(), port)
        } else {
            match without_scheme.split_once(':') {
                Some((_, rest)) if rest.contains(':') => {
                    return Err(ClientError::Config(format!(
                        "IPv6 server address {:?} must be written as [host]:port",
                        raw
                    )));
                }
                Some((host, port)) => (host.to_string(), parse_port(port)?),
                None => (without_scheme.to_string(), DEFAULT_SERVER_PORT),
            }
        };

        if host.is_empty() || host.contains(['[', ']', '/']) || port == 0 {
            return Err(ClientError::Config(format!("invalid server address {:?}", raw)));
        }

        Ok(Self {
            address: join_host_port(&host, port),
            host,
            port,
            healthy: AtomicBool::new(true),
            last_success: AtomicU64::new(0),
            last_failure: AtomicU64::new(0),
        })
    }

    /// Normalized `host:port`.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address of the gRPC endpoint (`port + offset`, modulo 2^16 so remapped
    /// ports below the HTTP port stay reachable).
    pub fn grpc_address(&self, port_offset: u16) -> String {
        join_host_port(&self.host, self.port.wrapping_add(port_offset))
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Record a successful exchange.
    pub fn mark_healthy(&self) {
        self.last_success.store(epoch_millis(), Ordering::Release);
        if !self.healthy.swap(true, Ordering::AcqRel) {
            info!(server = %self.address, "Server marked healthy");
            metrics::record_server_health(&self.address, true);
        }
    }

    /// Record a failed exchange.
    pub fn mark_unhealthy(&self) {
        self.last_failure.store(epoch_millis(), Ordering::Release);
        if self.healthy.swap(false, Ordering::AcqRel) {
            warn!(server = %self.address, "Server marked unhealthy");
            metrics::record_server_health(&self.address, false);
        }
    }

    /// Epoch millis of the last success, `None` if never.
    pub fn last_success(&self) -> Option<u64> {
        match self.last_success.load(Ordering::Acquire) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Epoch millis of the last failure, `None` if never.
    pub fn last_failure(&self) -> Option<u64> {
        match self.last_failure.load(Ordering::Acquire) {
            0 => None,
            ms => Some(ms),
        }
    }
}

/// Round-robin selector over the configured servers.
#[derive(Debug)]
pub struct ServerListManager {
    servers: RwLock<Vec<Arc<ServerEndpoint>>>,
    cursor: AtomicUsize,
}

impl ServerListManager {
    /// Build from raw addresses. Duplicates are collapsed.
    pub fn new<S: AsRef<str>>(addrs: &[S]) -> Result<Self> {
        let servers = Self::parse_all(addrs)?;
        info!(server_count = servers.len(), "Server list initialized");
        Ok(Self {
            servers: RwLock::new(servers),
            cursor: AtomicUsize::new(0),
        })
    }

    fn parse_all<S: AsRef<str>>(addrs: &[S]) -> Result<Vec<Arc<ServerEndpoint>>> {
        let mut servers: Vec<Arc<ServerEndpoint>> = Vec::with_capacity(addrs.len());
        for raw in addrs {
            let endpoint = ServerEndpoint::parse(raw.as_ref())?;
            if servers.iter().all(|s| s.address() != endpoint.address()) {
                servers.push(Arc::new(endpoint));
            }
        }
        if servers.is_empty() {
            return Err(ClientError::Config("server list is empty".to_string()));
        }
        Ok(servers)
    }

    fn snapshot(&self) -> Vec<Arc<ServerEndpoint>> {
        match self.servers.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// All servers in configuration order.
    pub fn servers(&self) -> Vec<Arc<ServerEndpoint>> {
        self.snapshot()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn healthy_count(&self) -> usize {
        self.snapshot().iter().filter(|s| s.is_healthy()).count()
    }

    /// Next server: round-robin over healthy servers, or over all of them
    /// when none is healthy.
    pub fn get_next_server(&self) -> Arc<ServerEndpoint> {
        let servers = self.snapshot();
        let healthy: Vec<&Arc<ServerEndpoint>> = servers.iter().filter(|s| s.is_healthy()).collect();
        let tick = self.cursor.fetch_add(1, Ordering::Relaxed);

        if healthy.is_empty() {
            debug!("No healthy servers, selecting from full list");
            return Arc::clone(&servers[tick % servers.len()]);
        }
        Arc::clone(healthy[tick % healthy.len()])
    }

    /// Look up a server by normalized address.
    pub fn find(&self, address: &str) -> Option<Arc<ServerEndpoint>> {
        self.snapshot().into_iter().find(|s| s.address() == address)
    }

    pub fn mark_success(&self, address: &str) {
        if let Some(server) = self.find(address) {
            server.mark_healthy();
        }
    }

    pub fn mark_failure(&self, address: &str) {
        if let Some(server) = self.find(address) {
            server.mark_unhealthy();
        }
    }

    /// Replace the server list. Addresses present before keep their health.
    pub fn refresh<S: AsRef<str>>(&self, addrs: &[S]) -> Result<()> {
        let fresh = Self::parse_all(addrs)?;
        let current = self.snapshot();
        let merged: Vec<Arc<ServerEndpoint>> = fresh
            .into_iter()
            .map(|s| {
                current
                    .iter()
                    .find(|c| c.address() == s.address())
                    .cloned()
                    .unwrap_or(s)
            })
            .collect();

        info!(
            old_count = current.len(),
            new_count = merged.len(),
            "Server list refreshed"
        );
        match self.servers.write() {
            Ok(mut guard) => *guard = merged,
            Err(poisoned) => *poisoned.into_inner() = merged,
        }
        Ok(())
    }
}
