//! # Registry Client
//!
//! Resilient client core for a service registry and configuration service.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              RegistryClient                               │
//! │                                                                           │
//! │  ┌──────────────┐  ┌──────────┐  ┌──────────────┐                         │
//! │  │ NamingProxy  │  │ LockProxy│  │ ConfigService│   facades               │
//! │  └──────┬───────┘  └────┬─────┘  └──────┬───────┘                         │
//! │         │ record intent │               │                                 │
//! │         ▼               ▼               ▼                                 │
//! │  ┌───────────────────────────────────────────┐   ┌─────────────────────┐  │
//! │  │ RedoService (4 registries + replay worker)│◄──│ ConnectionManager   │  │
//! │  └───────────────────────────────────────────┘   │ (gRPC bidi stream,  │  │
//! │                                                  │  handshake, pushes) │  │
//! │  ┌──────────────────┐   ┌──────────────────┐     └─────────┬───────────┘  │
//! │  │ ServiceInfoHolder│◄──│ FailoverReactor  │               │              │
//! │  │ (diff + events)  │   │ (switch + disk)  │     ┌─────────▼───────────┐  │
//! │  └────────┬─────────┘   └──────────────────┘     │ ServerListManager   │  │
//! │           ▼                                      │ SecurityProxy       │  │
//! │     SnapshotStore (atomic JSON files)            │ ResilientTransport  │  │
//! │                                                  └─────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Redo
//!
//! Every register / subscribe / lock / listen call records what the
//! application wants before it talks to the server. When the connection drops,
//! the server forgets ephemeral state; after reconnect the redo worker replays
//! whatever is missing.
//!
//! ## Failover
//!
//! Every service and config view received from the server is persisted as a
//! snapshot. An operator-controlled switch file makes reads serve the
//! failover data instead of live data.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use registry_client::{ClientConfig, Instance, RegistryClient};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> registry_client::Result<()> {
//!     let config = ClientConfig::default();
//!     let client = RegistryClient::new(config)?;
//!     client.start().await?;
//!     client.wait_connected(Duration::from_secs(5)).await;
//!
//!     client
//!         .naming()
//!         .register_instance("orders", "DEFAULT_GROUP", Instance::new("10.0.0.1", 8080))
//!         .await?;
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod config_service;
pub mod error;
pub mod failover;
pub mod lock;
pub mod metrics;
pub mod naming;
pub mod redo;
pub mod remote;
pub mod resilience;
pub mod security;
pub mod server_list;
pub mod transport;

// Re-exports for convenience
pub use client::{ClientHealth, ClientState, RegistryClient};
pub use config::{AuthConfig, ClientConfig, FailoverConfig, NamingConfig, RedoConfig, TransportConfig};
pub use config_service::{ConfigChangeEvent, ConfigChangeListener, ConfigService, ConfigSnapshot};
pub use error::{ClientError, Result};
pub use failover::{FailoverEntry, FailoverKind, FailoverReactor, SnapshotStore};
pub use lock::LockProxy;
pub use naming::{Instance, InstancesChangeEvent, InstancesDiff, InstancesDiffer, NamingGrpcProxy, ServiceSnapshot};
pub use redo::{RedoExecutor, RedoService, RedoType};
pub use remote::{ConnectionManager, ConnectionState};
pub use server_list::ServerListManager;
