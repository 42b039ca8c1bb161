// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request dispatch with server failover.
//!
//! [`ResilientTransport::execute()`] is the single retry loop every outbound
//! HTTP call goes through:
//!
//! ```text
//! for attempt in 1..=server_count:
//!     server = next_server()            # healthy round-robin
//!     token  = security.token()         # lazy login
//!     result = timeout(f(server, token))
//!     ok          -> mark healthy, return
//!     fail-fast   -> return              # InvalidInput, NotFound
//!     auth denied -> refresh token once, retry same attempt
//!     transient   -> mark unhealthy, next server
//! -> RetriesExhausted { attempts, last }
//! ```

pub mod http;

pub use http::HttpTransport;

use crate::error::{ClientError, Result};
use crate::metrics;
use crate::security::SecurityProxy;
use crate::server_list::ServerListManager;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Where one attempt should go, and with which token.
#[derive(Debug, Clone)]
pub struct RequestTarget {
    pub server: String,
    pub access_token: Option<String>,
}

/// Server-failover retry loop shared by the HTTP transport.
pub struct ResilientTransport {
    servers: Arc<ServerListManager>,
    security: Arc<SecurityProxy>,
    request_timeout: Duration,
}

impl ResilientTransport {
    pub fn new(servers: Arc<ServerListManager>, security: Arc<SecurityProxy>, request_timeout: Duration) -> Self {
        Self {
            servers,
            security,
            request_timeout,
        }
    }

    pub fn servers(&self) -> &Arc<ServerListManager> {
        &self.servers
    }

    pub fn security(&self) -> &Arc<SecurityProxy> {
        &self.security
    }

    /// Run `f` against successive servers until it succeeds or every server
    /// has been tried once.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut(RequestTarget) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.servers.len().max(1);
        let mut attempts = 0;
        let mut token_refreshed = false;
        let mut last_error: Option<ClientError> = None;

        while attempts < max_attempts {
            attempts += 1;
            let server = self.servers.get_next_server();
            let access_token = self.security.get_access_token().await?;
            let target = RequestTarget {
                server: server.address().to_string(),
                access_token,
            };

            let start = Instant::now();
            let outcome = timeout(self.request_timeout, f(target)).await;
            let elapsed = start.elapsed();

            match outcome {
                Ok(Ok(value)) => {
                    server.mark_healthy();
                    metrics::record_request(operation, server.address(), true, elapsed);
                    if attempts > 1 {
                        debug!(operation, server = %server.address(), attempts, "Request succeeded after failover");
                    }
                    return Ok(value);
                }
                Ok(Err(ClientError::AuthDenied(reason)))
                    if self.security.is_enabled() && !token_refreshed =>
                {
                    // The token may have been revoked server-side: refresh once.
                    warn!(operation, server = %server.address(), reason = %reason, "Request denied, refreshing token");
                    token_refreshed = true;
                    self.security.invalidate().await;
                    attempts -= 1;
                }
                Ok(Err(e)) if e.is_retryable() => {
                    server.mark_unhealthy();
                    metrics::record_request(operation, server.address(), false, elapsed);
                    warn!(
                        operation,
                        server = %server.address(),
                        attempt = attempts,
                        max_attempts,
                        error = %e,
                        "Request failed, trying next server"
                    );
                    last_error = Some(e);
                }
                Ok(Err(e)) => {
                    // The server answered; it is reachable even if it said no.
                    server.mark_healthy();
                    metrics::record_request(operation, server.address(), false, elapsed);
                    return Err(e);
                }
                Err(_) => {
                    server.mark_unhealthy();
                    metrics::record_request(operation, server.address(), false, elapsed);
                    warn!(
                        operation,
                        server = %server.address(),
                        attempt = attempts,
                        timeout_ms = self.request_timeout.as_millis() as u64,
                        "Request timed out, trying next server"
                    );
                    last_error = Some(ClientError::transient(
                        server.address(),
                        format!("timed out after {}ms", self.request_timeout.as_millis()),
                    ));
                }
            }
        }

        metrics::record_request_exhausted(operation, attempts);
        Err(ClientError::RetriesExhausted {
            attempts,
            last: Box::new(
                last_error.unwrap_or_else(|| ClientError::Internal("no attempt was made".to_string())),
            ),
        })
    }
}
