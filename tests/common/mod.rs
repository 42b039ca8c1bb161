// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - An in-memory server speaking the client's gRPC message set
//! - Nacos testcontainer setup
//! - Client construction helpers

pub mod containers;
pub mod mock_server;

pub use containers::*;
pub use mock_server::*;

use registry_client::config::FailoverConfig;
use registry_client::{ClientConfig, RegistryClient};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Route client logs to the test harness. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short timings, disk state under `dir`.
pub fn test_config(dir: &TempDir, servers: &[&str]) -> ClientConfig {
    let mut config = ClientConfig::for_testing(servers);
    config.failover = FailoverConfig {
        refresh_interval: "50ms".to_string(),
        ..FailoverConfig::rooted_at(dir.path())
    };
    config
}

/// A client wired to `server` instead of real gRPC.
pub fn client_for(server: &Arc<MockServer>, config: ClientConfig) -> RegistryClient {
    init_tracing();
    RegistryClient::with_components(config, server.clone(), Arc::new(NoLogin)).unwrap()
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
