// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Access token cache with lazy, single-flight refresh.
//!
//! # Token Validity
//!
//! ```text
//! obtained_at                      obtained_at + ttl - ahead   obtained_at + ttl
//!      |---------------- valid ---------------|--- refresh ---|
//! ```
//!
//! Expiry is computed on every check, never stored. A token with an empty
//! value or a non-positive TTL is always expired.
//!
//! # Refresh
//!
//! [`SecurityProxy::get_access_token()`] is double-checked: the fast path only
//! reads the cache; on a miss it takes the login mutex, re-checks, and only
//! then logs in. Concurrent callers that hit an expired token therefore
//! trigger exactly one login.

use crate::config::ClientConfig;
use crate::error::{BoxFuture, ClientError, Result};
use crate::metrics;
use crate::resilience::RetryConfig;
use crate::server_list::ServerListManager;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Login endpoint, relative to the context path.
pub const LOGIN_PATH: &str = "/v1/auth/login";

/// Header carrying the token on every authenticated request.
pub const ACCESS_TOKEN_HEADER: &str = "accessToken";

/// A token handed out by the server.
#[derive(Debug, Clone)]
pub struct AccessToken {
    token: String,
    ttl_secs: i64,
    obtained_at: Instant,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, ttl_secs: i64, obtained_at: Instant) -> Self {
        Self {
            token: token.into(),
            ttl_secs,
            obtained_at,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    pub fn obtained_at(&self) -> Instant {
        self.obtained_at
    }

    /// Default refresh window: a tenth of the TTL.
    pub fn default_ahead_window(&self) -> Duration {
        Duration::from_secs(self.ttl_secs.max(0) as u64 / 10)
    }

    /// Valid iff `now < obtained_at + ttl - ahead`.
    ///
    /// A deadline past what `Instant` can represent never expires.
    pub fn is_valid_at(&self, now: Instant, ahead: Duration) -> bool {
        if self.token.is_empty() || self.ttl_secs <= 0 {
            return false;
        }
        let ttl = Duration::from_secs(self.ttl_secs as u64);
        match ttl.checked_sub(ahead) {
            Some(usable) => self
                .obtained_at
                .checked_add(usable)
                .map_or(true, |deadline| now < deadline),
            None => false,
        }
    }

    pub fn is_expired_at(&self, now: Instant, ahead: Duration) -> bool {
        !self.is_valid_at(now, ahead)
    }
}

/// Performs the actual login call. Implemented over HTTP by [`HttpAuthenticator`].
pub trait Authenticator: Send + Sync + 'static {
    /// Log in against one server.
    ///
    /// Credential rejection must be reported as [`ClientError::AuthDenied`];
    /// anything else is treated as retryable by the proxy.
    fn login<'a>(&'a self, server: &'a str, username: &'a str, password: &'a str) -> BoxFuture<'a, AccessToken>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
    #[serde(default)]
    token_ttl: i64,
}

/// Form-encoded `POST {context}/v1/auth/login`.
pub struct HttpAuthenticator {
    client: reqwest::Client,
    scheme: String,
    context_path: String,
    timeout: Duration,
}

impl HttpAuthenticator {
    pub fn new(client: reqwest::Client, config: &ClientConfig) -> Self {
        Self {
            client,
            scheme: config.transport.scheme.clone(),
            context_path: config.context_path.clone(),
            timeout: config.transport.request_timeout_duration(),
        }
    }
}

impl Authenticator for HttpAuthenticator {
    fn login<'a>(&'a self, server: &'a str, username: &'a str, password: &'a str) -> BoxFuture<'a, AccessToken> {
        Box::pin(async move {
            let url = format!("{}://{}{}{}", self.scheme, server, self.context_path, LOGIN_PATH);
            let response = self
                .client
                .post(&url)
                .timeout(self.timeout)
                .form(&[("username", username), ("password", password)])
                .send()
                .await
                .map_err(|e| ClientError::from_reqwest(server, e))?;

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| ClientError::from_reqwest(server, e))?;
            if !status.is_success() {
                return Err(ClientError::from_status(server, status.as_u16(), body));
            }

            let parsed: LoginResponse = serde_json::from_str(&body)?;
            Ok(AccessToken::new(parsed.access_token, parsed.token_ttl, Instant::now()))
        })
    }
}

/// Cached access token plus the login procedure that refreshes it.
pub struct SecurityProxy {
    credentials: Option<(String, String)>,
    servers: Arc<ServerListManager>,
    authenticator: Arc<dyn Authenticator>,
    retry: RetryConfig,
    refresh_window: Option<Duration>,
    token: RwLock<Option<AccessToken>>,
    login_lock: Mutex<()>,
}

impl SecurityProxy {
    pub fn new(config: &ClientConfig, servers: Arc<ServerListManager>, authenticator: Arc<dyn Authenticator>) -> Self {
        let credentials = match (&config.auth.username, &config.auth.password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        };
        Self {
            credentials,
            servers,
            authenticator,
            retry: RetryConfig::fixed(
                config.auth.login_retry_attempts,
                config.auth.login_retry_delay_duration(),
            ),
            refresh_window: config.auth.refresh_window_duration(),
            token: RwLock::new(None),
            login_lock: Mutex::new(()),
        }
    }

    /// Whether requests need a token at all.
    pub fn is_enabled(&self) -> bool {
        self.credentials.is_some()
    }

    fn ahead_window(&self, token: &AccessToken) -> Duration {
        self.refresh_window.unwrap_or_else(|| token.default_ahead_window())
    }

    async fn cached_valid(&self) -> Option<String> {
        let guard = self.token.read().await;
        guard.as_ref().and_then(|t| {
            if t.is_valid_at(Instant::now(), self.ahead_window(t)) {
                Some(t.token().to_string())
            } else {
                None
            }
        })
    }

    /// Current token, logging in first if the cached one is missing or expiring.
    ///
    /// Returns `Ok(None)` when authentication is disabled.
    pub async fn get_access_token(&self) -> Result<Option<String>> {
        let Some((username, password)) = self.credentials.as_ref() else {
            return Ok(None);
        };

        if let Some(token) = self.cached_valid().await {
            return Ok(Some(token));
        }

        let _guard = self.login_lock.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(token) = self.cached_valid().await {
            return Ok(Some(token));
        }

        let token = self.login_with_retry(username, password).await?;
        let value = token.token().to_string();
        *self.token.write().await = Some(token);
        Ok(Some(value))
    }

    async fn login_with_retry(&self, username: &str, password: &str) -> Result<AccessToken> {
        let mut attempt = 0;
        let mut last_error: Option<ClientError> = None;

        while self.retry.allows_another(attempt) {
            attempt += 1;
            let server = self.servers.get_next_server();

            match self.authenticator.login(server.address(), username, password).await {
                Ok(token) => {
                    metrics::record_login(true);
                    info!(
                        server = %server.address(),
                        attempt,
                        ttl_secs = token.ttl_secs(),
                        "Login succeeded"
                    );
                    return Ok(token);
                }
                Err(ClientError::AuthDenied(reason)) => {
                    metrics::record_login(false);
                    warn!(server = %server.address(), reason = %reason, "Login rejected");
                    return Err(ClientError::AuthDenied(reason));
                }
                Err(e) => {
                    metrics::record_login(false);
                    warn!(
                        server = %server.address(),
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        error = %e,
                        "Login attempt failed"
                    );
                    last_error = Some(e);
                    if self.retry.allows_another(attempt) {
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }

        let cause = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt made".to_string());
        Err(ClientError::AuthDenied(format!(
            "login failed after {} attempts: {}",
            attempt, cause
        )))
    }

    /// Drop the cached token so the next call logs in again.
    pub async fn invalidate(&self) {
        debug!("Access token invalidated");
        *self.token.write().await = None;
    }

    /// Snapshot of the cached token, for diagnostics.
    pub async fn cached_token(&self) -> Option<AccessToken> {
        self.token.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted authenticator: fails `fail_first` times, then succeeds.
    struct ScriptedAuth {
        calls: AtomicUsize,
        fail_first: usize,
        reject: bool,
        ttl_secs: i64,
    }

    impl ScriptedAuth {
        fn succeeding(ttl_secs: i64) -> Self {
            Self { calls: AtomicUsize::new(0), fail_first: 0, reject: false, ttl_secs }
        }
    }

    impl Authenticator for ScriptedAuth {
        fn login<'a>(&'a self, server: &'a str, _u: &'a str, _p: &'a str) -> BoxFuture<'a, AccessToken> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if self.reject {
                    return Err(ClientError::AuthDenied("bad credentials".into()));
                }
                if n < self.fail_first {
                    return Err(ClientError::transient(server, "connection refused"));
                }
                Ok(AccessToken::new(format!("token-{}", n), self.ttl_secs, Instant::now()))
            })
        }
    }

    fn proxy_with(auth: Arc<ScriptedAuth>, attempts: usize) -> SecurityProxy {
        let mut config = ClientConfig::for_testing(&["a:8848", "b:8848"]);
        config.auth.username = Some("user".into());
        config.auth.password = Some("pass".into());
        config.auth.login_retry_attempts = attempts;
        config.auth.login_retry_delay = "1ms".into();
        let servers = Arc::new(ServerListManager::new(config.server_addrs.as_slice()).unwrap());
        SecurityProxy::new(&config, servers, auth)
    }

    #[test]
    fn test_token_validity_boundary() {
        let t0 = Instant::now();
        let token = AccessToken::new("abc", 100, t0);
        let ahead = Duration::from_secs(10);
        assert!(token.is_valid_at(t0, ahead));
        assert!(token.is_valid_at(t0 + Duration::from_secs(89), ahead));
        assert!(token.is_expired_at(t0 + Duration::from_secs(90), ahead));
        assert!(token.is_expired_at(t0 + Duration::from_secs(200), ahead));
    }

    #[test]
    fn test_empty_or_non_positive_ttl_is_expired() {
        let t0 = Instant::now();
        assert!(AccessToken::new("", 100, t0).is_expired_at(t0, Duration::ZERO));
        assert!(AccessToken::new("abc", 0, t0).is_expired_at(t0, Duration::ZERO));
        assert!(AccessToken::new("abc", -5, t0).is_expired_at(t0, Duration::ZERO));
    }

    #[test]
    fn test_window_larger_than_ttl_is_expired() {
        let t0 = Instant::now();
        let token = AccessToken::new("abc", 5, t0);
        assert!(token.is_expired_at(t0, Duration::from_secs(10)));
    }

    #[test]
    fn test_huge_server_ttl_never_expires() {
        let t0 = Instant::now();
        let token = AccessToken::new("abc", i64::MAX, t0);
        let ahead = token.default_ahead_window();
        assert!(token.is_valid_at(t0, ahead));
        assert!(token.is_valid_at(t0 + Duration::from_secs(86_400 * 365), ahead));
        assert!(token.is_valid_at(t0, Duration::ZERO));
    }

    #[tokio::test]
    async fn test_huge_server_ttl_token_is_cached() {
        let auth = Arc::new(ScriptedAuth::succeeding(i64::MAX));
        let proxy = proxy_with(auth.clone(), 1);
        assert_eq!(proxy.get_access_token().await.unwrap().as_deref(), Some("token-0"));
        assert_eq!(proxy.get_access_token().await.unwrap().as_deref(), Some("token-0"));
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_ahead_window() {
        let token = AccessToken::new("abc", 18_000, Instant::now());
        assert_eq!(token.default_ahead_window(), Duration::from_secs(1_800));
    }

    #[tokio::test]
    async fn test_disabled_returns_none() {
        let config = ClientConfig::for_testing(&["a:8848"]);
        let servers = Arc::new(ServerListManager::new(config.server_addrs.as_slice()).unwrap());
        let auth = Arc::new(ScriptedAuth::succeeding(100));
        let proxy = SecurityProxy::new(&config, servers, auth.clone());
        assert!(!proxy.is_enabled());
        assert_eq!(proxy.get_access_token().await.unwrap(), None);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cached_token_reused() {
        let auth = Arc::new(ScriptedAuth::succeeding(18_000));
        let proxy = proxy_with(auth.clone(), 3);
        let first = proxy.get_access_token().await.unwrap();
        let second = proxy.get_access_token().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_login_once() {
        let auth = Arc::new(ScriptedAuth::succeeding(18_000));
        let proxy = Arc::new(proxy_with(auth.clone(), 3));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let proxy = Arc::clone(&proxy);
            handles.push(tokio::spawn(async move { proxy.get_access_token().await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().as_deref(), Some("token-0"));
        }
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_retried() {
        let auth = Arc::new(ScriptedAuth { calls: AtomicUsize::new(0), fail_first: 2, reject: false, ttl_secs: 100 });
        let proxy = proxy_with(auth.clone(), 3);
        assert_eq!(proxy.get_access_token().await.unwrap().as_deref(), Some("token-2"));
        assert_eq!(auth.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_raise_auth_error() {
        let auth = Arc::new(ScriptedAuth { calls: AtomicUsize::new(0), fail_first: 10, reject: false, ttl_secs: 100 });
        let proxy = proxy_with(auth.clone(), 3);
        let err = proxy.get_access_token().await.unwrap_err();
        assert!(matches!(err, ClientError::AuthDenied(_)));
        assert!(err.to_string().contains("3 attempts"));
        assert_eq!(auth.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejected_credentials_fail_fast() {
        let auth = Arc::new(ScriptedAuth { calls: AtomicUsize::new(0), fail_first: 0, reject: true, ttl_secs: 100 });
        let proxy = proxy_with(auth.clone(), 5);
        assert!(matches!(proxy.get_access_token().await, Err(ClientError::AuthDenied(_))));
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_new_login() {
        let auth = Arc::new(ScriptedAuth::succeeding(18_000));
        let proxy = proxy_with(auth.clone(), 3);
        proxy.get_access_token().await.unwrap();
        proxy.invalidate().await;
        assert!(proxy.cached_token().await.is_none());
        assert_eq!(proxy.get_access_token().await.unwrap().as_deref(), Some("token-1"));
        assert_eq!(auth.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_short_ttl_token_relogs_every_time() {
        // ttl 0 is always expired, so every call logs in again
        let auth = Arc::new(ScriptedAuth::succeeding(0));
        let proxy = proxy_with(auth.clone(), 1);
        proxy.get_access_token().await.unwrap();
        proxy.get_access_token().await.unwrap();
        assert_eq!(auth.calls.load(Ordering::SeqCst), 2);
    }
}
