// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Client state types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ shutdown()                   │ (workers spawned)
//!    ↓                              ↓
//! Stopped ←── ShuttingDown ←──── Running
//!
//! Starting ──(start error)──→ Failed
//! ```
//!
//! - **Created**: after `RegistryClient::new()`. Nothing runs yet; requests
//!   made now are recorded for redo and fail with `Disconnected`.
//! - **Starting**: loading snapshots, registering push handlers, spawning workers.
//! - **Running**: connection, redo and failover workers are alive.
//! - **ShuttingDown**: shutdown signalled, workers draining.
//! - **Stopped**: every worker joined. Terminal.
//! - **Failed**: start aborted. Terminal.

use crate::remote::ConnectionState;

/// Lifecycle of a [`RegistryClient`](super::RegistryClient).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientState::Created => write!(f, "Created"),
            ClientState::Starting => write!(f, "Starting"),
            ClientState::Running => write!(f, "Running"),
            ClientState::ShuttingDown => write!(f, "ShuttingDown"),
            ClientState::Stopped => write!(f, "Stopped"),
            ClientState::Failed => write!(f, "Failed"),
        }
    }
}

/// Point-in-time health snapshot. Collecting it does no network I/O.
#[derive(Debug, Clone)]
pub struct ClientHealth {
    pub state: ClientState,
    pub connection: ConnectionState,
    pub connection_id: Option<String>,
    /// Running and connected.
    pub ready: bool,
    pub servers_total: usize,
    pub servers_healthy: usize,
    pub failover_enabled: bool,
    /// Redo entries with an action still outstanding, across all registries.
    pub redo_pending: usize,
    /// Ready, at least one healthy server, nothing waiting for redo.
    pub healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_state_display() {
        assert_eq!(ClientState::Created.to_string(), "Created");
        assert_eq!(ClientState::Starting.to_string(), "Starting");
        assert_eq!(ClientState::Running.to_string(), "Running");
        assert_eq!(ClientState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(ClientState::Stopped.to_string(), "Stopped");
        assert_eq!(ClientState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_client_state_copy() {
        let state = ClientState::Failed;
        let copied: ClientState = state;
        assert_eq!(state, copied);
        assert_ne!(ClientState::Created, ClientState::Running);
    }
}
