//! Configuration for the registry client.
//!
//! Configuration is passed to [`RegistryClient::new()`](crate::RegistryClient::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use registry_client::config::ClientConfig;
//!
//! let config = ClientConfig {
//!     server_addrs: vec!["10.0.0.1:8848".into(), "10.0.0.2:8848".into()],
//!     namespace: "prod".into(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ClientConfig
//! ├── server_addrs: Vec<String>     # host:port, HTTP port
//! ├── namespace: String             # tenant, "" = public
//! ├── context_path: String          # HTTP prefix, "/nacos"
//! ├── auth: AuthConfig              # credentials + login retry
//! ├── transport: TransportConfig    # timeouts, gRPC port offset, labels
//! ├── redo: RedoConfig              # replay delay + optional rate limit
//! ├── failover: FailoverConfig      # failover / snapshot directories
//! └── naming: NamingConfig          # push protection, stale tolerance
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! server_addrs: ["10.0.0.1:8848", "10.0.0.2:8848"]
//! namespace: "prod"
//!
//! auth:
//!   username: "svc-orders"
//!   password: "secret"
//!   login_retry_attempts: 3
//!
//! transport:
//!   request_timeout: "3s"
//!   grpc_port_offset: 1000
//!
//! redo:
//!   delay: "3s"
//!
//! failover:
//!   failover_dir: "/var/lib/app/registry/failover"
//! ```

use crate::error::{ClientError, Result};
use crate::resilience::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Parse a humantime duration string, falling back when malformed.
fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to RegistryClient::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server addresses as `host:port` (the HTTP port).
    /// The gRPC port is derived by adding `transport.grpc_port_offset`.
    pub server_addrs: Vec<String>,

    /// Namespace (tenant) every request is scoped to. Empty means public.
    #[serde(default)]
    pub namespace: String,

    /// HTTP context path prepended to every endpoint.
    #[serde(default = "default_context_path")]
    pub context_path: String,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub redo: RedoConfig,

    #[serde(default)]
    pub failover: FailoverConfig,

    #[serde(default)]
    pub naming: NamingConfig,
}

fn default_context_path() -> String {
    "/nacos".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addrs: vec!["127.0.0.1:8848".to_string()],
            namespace: String::new(),
            context_path: default_context_path(),
            auth: AuthConfig::default(),
            transport: TransportConfig::default(),
            redo: RedoConfig::default(),
            failover: FailoverConfig::default(),
            naming: NamingConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create a config with short timings for tests.
    ///
    /// Snapshot and failover directories are left relative; tests that touch
    /// the disk should point them at a `tempfile::TempDir`.
    pub fn for_testing(server_addrs: &[&str]) -> Self {
        Self {
            server_addrs: server_addrs.iter().map(|s| s.to_string()).collect(),
            namespace: String::new(),
            context_path: default_context_path(),
            auth: AuthConfig::default(),
            transport: TransportConfig::for_testing(),
            redo: RedoConfig {
                delay: "50ms".to_string(),
                ..Default::default()
            },
            failover: FailoverConfig {
                refresh_interval: "50ms".to_string(),
                ..Default::default()
            },
            naming: NamingConfig::default(),
        }
    }

    /// Check the config for values the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server_addrs.is_empty() {
            return Err(ClientError::Config("server_addrs must not be empty".to_string()));
        }
        if let Some(addr) = self.server_addrs.iter().find(|a| a.trim().is_empty()) {
            return Err(ClientError::Config(format!("invalid server address {:?}", addr)));
        }
        if !self.context_path.is_empty() && !self.context_path.starts_with('/') {
            return Err(ClientError::Config(format!(
                "context_path must start with '/', got {:?}",
                self.context_path
            )));
        }
        if self.auth.username.is_some() != self.auth.password.is_some() {
            return Err(ClientError::Config(
                "auth.username and auth.password must be set together".to_string(),
            ));
        }
        if self.auth.login_retry_attempts == 0 {
            return Err(ClientError::Config("auth.login_retry_attempts must be >= 1".to_string()));
        }
        Ok(())
    }

    /// Tenant label used for snapshot paths ("public" when unset).
    pub fn tenant_label(&self) -> &str {
        if self.namespace.is_empty() {
            "public"
        } else {
            &self.namespace
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AuthConfig: credentials and login retry
// ═══════════════════════════════════════════════════════════════════════════════

/// Username/password authentication settings.
///
/// Authentication is enabled when both `username` and `password` are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Login attempts before giving up with an authentication error.
    #[serde(default = "default_login_retry_attempts")]
    pub login_retry_attempts: usize,

    /// Fixed delay between login attempts (e.g., "1s").
    #[serde(default = "default_login_retry_delay")]
    pub login_retry_delay: String,

    /// Refresh this long before the token expires (e.g., "30s").
    /// When unset, a tenth of the server-provided TTL is used.
    #[serde(default)]
    pub refresh_window: Option<String>,
}

fn default_login_retry_attempts() -> usize {
    3
}

fn default_login_retry_delay() -> String {
    "1s".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            login_retry_attempts: 3,
            login_retry_delay: "1s".to_string(),
            refresh_window: None,
        }
    }
}

impl AuthConfig {
    /// Create auth settings with credentials.
    pub fn with_credentials(username: &str, password: &str) -> Self {
        Self {
            username: Some(username.to_string()),
            password: Some(password.to_string()),
            ..Default::default()
        }
    }

    /// Whether login is required before requests.
    pub fn is_enabled(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    pub fn login_retry_delay_duration(&self) -> Duration {
        parse_duration_or(&self.login_retry_delay, Duration::from_secs(1))
    }

    /// Parsed refresh window, `None` to derive it from the token TTL.
    pub fn refresh_window_duration(&self) -> Option<Duration> {
        self.refresh_window
            .as_deref()
            .and_then(|w| humantime::parse_duration(w).ok())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TransportConfig: timeouts and connection settings
// ═══════════════════════════════════════════════════════════════════════════════

/// HTTP and gRPC transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Per-attempt request timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// Timeout for establishing a transport connection to one server.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// How long to wait for the server's ability table after setup.
    #[serde(default = "default_setup_timeout")]
    pub setup_timeout: String,

    /// Interval between connection health checks.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: String,

    /// Added to the HTTP port to reach the gRPC port.
    #[serde(default = "default_grpc_port_offset")]
    pub grpc_port_offset: u16,

    /// Client version reported in the connection handshake.
    #[serde(default = "default_client_version")]
    pub client_version: String,

    /// Labels reported in the connection handshake.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// URL scheme for HTTP endpoints.
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

fn default_request_timeout() -> String {
    "3s".to_string()
}

fn default_connect_timeout() -> String {
    "3s".to_string()
}

fn default_setup_timeout() -> String {
    "3s".to_string()
}

fn default_health_check_interval() -> String {
    "5s".to_string()
}

fn default_grpc_port_offset() -> u16 {
    1000
}

fn default_client_version() -> String {
    format!("registry-client-rust:v{}", env!("CARGO_PKG_VERSION"))
}

fn default_scheme() -> String {
    "http".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
            setup_timeout: default_setup_timeout(),
            health_check_interval: default_health_check_interval(),
            grpc_port_offset: 1000,
            client_version: default_client_version(),
            labels: BTreeMap::new(),
            scheme: default_scheme(),
        }
    }
}

impl TransportConfig {
    /// Short timeouts so tests fail fast.
    pub fn for_testing() -> Self {
        Self {
            request_timeout: "500ms".to_string(),
            connect_timeout: "500ms".to_string(),
            setup_timeout: "100ms".to_string(),
            health_check_interval: "1s".to_string(),
            ..Default::default()
        }
    }

    pub fn request_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.request_timeout, Duration::from_secs(3))
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.connect_timeout, Duration::from_secs(3))
    }

    pub fn setup_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.setup_timeout, Duration::from_secs(3))
    }

    pub fn health_check_interval_duration(&self) -> Duration {
        parse_duration_or(&self.health_check_interval, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RedoConfig: reconciliation worker
// ═══════════════════════════════════════════════════════════════════════════════

/// Redo (intent replay) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedoConfig {
    /// Whether the redo worker runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Fixed delay between redo cycles (e.g., "3s").
    #[serde(default = "default_redo_delay")]
    pub delay: String,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting (replay storm prevention after reconnect)
    // ─────────────────────────────────────────────────────────────────────────

    /// Throttle replay calls. Useful when thousands of entries come back at once.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Sustained replay calls per second.
    #[serde(default = "default_redo_rate_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Replay burst size.
    #[serde(default = "default_redo_rate_burst")]
    pub rate_limit_burst: u32,
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_redo_delay() -> String {
    "3s".to_string()
}

fn default_redo_rate_per_sec() -> u32 {
    200
}

fn default_redo_rate_burst() -> u32 {
    50
}

impl Default for RedoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: default_redo_delay(),
            rate_limit_enabled: false,
            rate_limit_per_sec: 200,
            rate_limit_burst: 50,
        }
    }
}

impl RedoConfig {
    pub fn delay_duration(&self) -> Duration {
        parse_duration_or(&self.delay, Duration::from_secs(3))
    }

    /// Rate limit configuration for replay calls, `None` when disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst: self.rate_limit_burst,
                per_second: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FailoverConfig: local snapshots and failover data
// ═══════════════════════════════════════════════════════════════════════════════

/// Failover reactor and snapshot persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Poll the disk failover data source.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory holding operator-provided failover data and the switch file.
    #[serde(default = "default_failover_dir")]
    pub failover_dir: String,

    /// Persist every service/config snapshot received from the server.
    #[serde(default = "default_true")]
    pub snapshot_enabled: bool,

    /// Directory for snapshots written by the client.
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: String,

    /// Delay between failover data source polls.
    #[serde(default = "default_failover_refresh_interval")]
    pub refresh_interval: String,
}

fn default_failover_dir() -> String {
    "registry_client/failover".to_string()
}

fn default_snapshot_dir() -> String {
    "registry_client/snapshot".to_string()
}

fn default_failover_refresh_interval() -> String {
    "5s".to_string()
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failover_dir: default_failover_dir(),
            snapshot_enabled: true,
            snapshot_dir: default_snapshot_dir(),
            refresh_interval: default_failover_refresh_interval(),
        }
    }
}

impl FailoverConfig {
    /// Point both directories below `root` (handy with `tempfile`).
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            failover_dir: root.join("failover").display().to_string(),
            snapshot_dir: root.join("snapshot").display().to_string(),
            ..Default::default()
        }
    }

    pub fn refresh_interval_duration(&self) -> Duration {
        parse_duration_or(&self.refresh_interval, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NamingConfig: service info handling
// ═══════════════════════════════════════════════════════════════════════════════

/// Service discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NamingConfig {
    /// Ignore pushes with an empty instance list when a non-empty one is cached.
    #[serde(default)]
    pub push_empty_protection: bool,

    /// Load persisted service snapshots into memory at start.
    #[serde(default)]
    pub load_cache_at_start: bool,

    /// Clock-skew allowance for the stale-push guard (milliseconds).
    /// A push is stale when `cached.last_ref_time > push.last_ref_time + tolerance`.
    #[serde(default)]
    pub stale_push_tolerance_ms: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
