// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the registry client.
//!
//! Every failure surfaced by the client is classified into one of a small
//! number of categories. The category decides what the caller (or the
//! resilient transport) does next.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transient` | Yes | Timeouts, connection failures, 5xx answers |
//! | `RetriesExhausted` | No | Every server was tried; carries the last cause |
//! | `InvalidInput` | No | Rejected parameters (client- or server-side) |
//! | `AuthDenied` | No | Bad credentials or missing permission |
//! | `NotFound` | No | The resource does not exist |
//! | `Disconnected` | No | No usable connection; intent stays queued for redo |
//! | `Config` | No | Client configuration invalid |
//! | `Snapshot` | No | Local snapshot I/O failure |
//! | `Serialization` | No | Malformed JSON on the wire or on disk |
//! | `InvalidState` | No | Lifecycle state machine violation |
//! | `Shutdown` | No | Client is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! [`ClientError::is_retryable()`] tells the transport whether the next server
//! should be tried. [`ClientError::is_connectivity()`] tells the naming, lock
//! and config facades whether a failure should degrade to "queued for redo"
//! instead of being raised to the application.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Type alias for boxed async futures used by collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Errors that can occur inside the client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Parameters were rejected.
    ///
    /// Raised synchronously by validation or returned by the server as a
    /// 400-class answer. Never retried.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A single attempt against one server failed in a way that another
    /// server (or a later attempt) may not.
    #[error("Transient error ({server}): {message}")]
    Transient { server: String, message: String },

    /// All attempts failed. `last` is the most recent transient cause.
    #[error("Request failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        last: Box<ClientError>,
    },

    /// Authentication failed or the token lacks permission.
    #[error("Authorization denied: {0}")]
    AuthDenied(String),

    /// The requested resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// No usable connection to any server.
    ///
    /// Operations that record intent (register, subscribe, lock, listen)
    /// keep that intent queued and replay it once a connection is back.
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Local snapshot file could not be read or written.
    #[error("Snapshot store error ({path}): {message}")]
    Snapshot { path: String, message: String },

    /// JSON encode/decode failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation attempted in the wrong lifecycle state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Create a transient error attributed to a server.
    pub fn transient(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            server: server.into(),
            message: message.into(),
        }
    }

    /// Create a snapshot error for a path.
    pub fn snapshot(path: impl AsRef<std::path::Path>, message: impl std::fmt::Display) -> Self {
        Self::Snapshot {
            path: path.as_ref().display().to_string(),
            message: message.to_string(),
        }
    }

    /// Check if this error is retryable against another server.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient { .. } => true,
            Self::RetriesExhausted { .. } => false, // Already aggregated
            Self::InvalidInput(_) => false,
            Self::AuthDenied(_) => false,
            Self::NotFound(_) => false,
            Self::Disconnected(_) => false,
            Self::Config(_) => false,
            Self::Snapshot { .. } => false,
            Self::Serialization(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error means "the server could not be reached".
    ///
    /// Facades turn these into a logged warning and leave the intent queued.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::RetriesExhausted { .. } | Self::Disconnected(_)
        )
    }

    /// Classify an HTTP status code.
    pub fn from_status(server: &str, status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            400 | 422 => Self::InvalidInput(body),
            401 | 403 => Self::AuthDenied(body),
            404 => Self::NotFound(body),
            _ => Self::transient(server, format!("HTTP {}: {}", status, body)),
        }
    }

    /// Classify an error code carried in a remoting response body.
    pub fn from_error_code(server: &str, code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            400 | 20_400 => Self::InvalidInput(message),
            401 | 403 => Self::AuthDenied(message),
            404 | 20_404 => Self::NotFound(message),
            _ => Self::transient(server, format!("error code {}: {}", code, message)),
        }
    }

    /// Classify a reqwest failure that happened before a status was read.
    pub fn from_reqwest(server: &str, err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(server, status.as_u16(), err.to_string());
        }
        if err.is_builder() {
            return Self::InvalidInput(err.to_string());
        }
        if err.is_decode() {
            return Self::Internal(format!("malformed response from {}: {}", server, err));
        }
        Self::transient(server, err.to_string())
    }
}

impl From<tonic::Status> for ClientError {
    fn from(status: tonic::Status) -> Self {
        use tonic::Code;
        let message = status.message().to_string();
        match status.code() {
            Code::InvalidArgument | Code::OutOfRange => Self::InvalidInput(message),
            Code::Unauthenticated | Code::PermissionDenied => Self::AuthDenied(message),
            Code::NotFound => Self::NotFound(message),
            code => Self::transient("unknown", format!("grpc {:?}: {}", code, message)),
        }
    }
}
