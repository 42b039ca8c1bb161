// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP endpoints under the configured context path.
//!
//! Every call goes through [`ResilientTransport`], so it inherits server
//! failover, health marking and the `accessToken` header.

use super::{RequestTarget, ResilientTransport};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::security::ACCESS_TOKEN_HEADER;
use reqwest::Method;
use tracing::trace;

/// Query/form parameters of one call.
pub type Params<'a> = [(&'a str, String)];

/// HTTP client bound to the server list.
pub struct HttpTransport {
    client: reqwest::Client,
    transport: ResilientTransport,
    scheme: String,
    context_path: String,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, transport: ResilientTransport, config: &ClientConfig) -> Self {
        Self {
            client,
            transport,
            scheme: config.transport.scheme.clone(),
            context_path: config.context_path.trim_end_matches('/').to_string(),
        }
    }

    pub fn transport(&self) -> &ResilientTransport {
        &self.transport
    }

    /// Absolute URL of `path` on `server`.
    pub fn url(&self, server: &str, path: &str) -> String {
        format!("{}://{}{}{}", self.scheme, server, self.context_path, path)
    }

    pub async fn get(&self, operation: &str, path: &str, params: &Params<'_>) -> Result<String> {
        self.send(operation, Method::GET, path, params).await
    }

    pub async fn post_form(&self, operation: &str, path: &str, params: &Params<'_>) -> Result<String> {
        self.send(operation, Method::POST, path, params).await
    }

    pub async fn delete(&self, operation: &str, path: &str, params: &Params<'_>) -> Result<String> {
        self.send(operation, Method::DELETE, path, params).await
    }

    async fn send(&self, operation: &str, method: Method, path: &str, params: &Params<'_>) -> Result<String> {
        self.transport
            .execute(operation, |target: RequestTarget| {
                let url = self.url(&target.server, path);
                trace!(operation, %method, url = %url, "Sending HTTP request");

                let mut request = self.client.request(method.clone(), url);
                if let Some(token) = &target.access_token {
                    request = request.header(ACCESS_TOKEN_HEADER, token);
                }
                request = if method == Method::POST {
                    request.form(params)
                } else {
                    request.query(params)
                };

                let server = target.server;
                async move {
                    let response = request
                        .send()
                        .await
                        .map_err(|e| ClientError::from_reqwest(&server, e))?;
                    let status = response.status();
                    let body = response
                        .text()
                        .await
                        .map_err(|e| ClientError::from_reqwest(&server, e))?;

                    if status.is_success() {
                        Ok(body)
                    } else {
                        Err(ClientError::from_status(&server, status.as_u16(), body))
                    }
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{HttpAuthenticator, SecurityProxy};
    use crate::server_list::ServerListManager;
    use std::sync::Arc;
    use std::time::Duration;

    fn http(addrs: &[&str]) -> HttpTransport {
        let config = ClientConfig::for_testing(addrs);
        let client = reqwest::Client::new();
        let servers = Arc::new(ServerListManager::new(config.server_addrs.as_slice()).unwrap());
        let auth = Arc::new(HttpAuthenticator::new(client.clone(), &config));
        let security = Arc::new(SecurityProxy::new(&config, Arc::clone(&servers), auth));
        let transport = ResilientTransport::new(servers, security, Duration::from_millis(500));
        HttpTransport::new(client, transport, &config)
    }

    #[test]
    fn test_url_includes_context_path() {
        let t = http(&["10.0.0.1:8848"]);
        assert_eq!(
            t.url("10.0.0.1:8848", "/v1/cs/configs"),
            "http://10.0.0.1:8848/nacos/v1/cs/configs"
        );
    }

    #[tokio::test]
    async fn test_unreachable_servers_exhaust() {
        // Port 1 on loopback refuses connections.
        let t = http(&["127.0.0.1:1"]);
        let err = t.get("config.get", "/v1/cs/configs", &[("dataId", "x".into())]).await.unwrap_err();
        assert!(err.is_connectivity(), "unexpected error: {err}");
        assert_eq!(t.transport().servers().healthy_count(), 0);
    }
}
