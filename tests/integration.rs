// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests against a real Nacos server.
//!
//! Tests use testcontainers for portability - no external docker-compose required.
//!
//! # Running Tests
//! ```bash
//! # Run all integration tests (requires Docker)
//! cargo test --test integration -- --ignored
//!
//! # Run specific test
//! cargo test --test integration naming_ -- --ignored
//! ```
//!
//! # Test Organization
//! - `naming_*` - registration, queries and subscription pushes
//! - `config_*` - publish, read and change listening

mod common;

use common::{grpc_offset, start_nacos, test_config};
use registry_client::config_service::{ConfigChangeEvent, ConfigChangeListener};
use registry_client::{ClientConfig, Instance, RegistryClient};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use testcontainers::clients::Cli;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(30);

fn nacos_config(dir: &TempDir, addr: &str, offset: u16) -> ClientConfig {
    let mut config = test_config(dir, &[addr]);
    config.transport.grpc_port_offset = offset;
    config.transport.request_timeout = "5s".to_string();
    config.transport.connect_timeout = "5s".to_string();
    config.transport.setup_timeout = "3s".to_string();
    config
}

async fn started(config: ClientConfig) -> RegistryClient {
    common::init_tracing();
    let client = RegistryClient::new(config).unwrap();
    client.start().await.unwrap();
    assert!(client.wait_connected(WAIT).await, "client never connected");
    client
}

// =============================================================================
// Naming
// =============================================================================

/// Test: A registered instance is visible to queries
#[tokio::test]
#[ignore]
async fn naming_register_and_query() {
    let docker = Cli::default();
    let (container, addr) = start_nacos(&docker);
    let dir = TempDir::new().unwrap();
    let client = started(nacos_config(&dir, &addr, grpc_offset(&container))).await;

    client
        .naming()
        .register_instance("it-orders", "DEFAULT_GROUP", Instance::new("10.1.1.1", 8080))
        .await
        .unwrap();

    let mut found = false;
    for _ in 0..30 {
        let view = client
            .naming()
            .query_instances("it-orders", "DEFAULT_GROUP", &[], false)
            .await
            .unwrap();
        if view.hosts.iter().any(|h| h.ip == "10.1.1.1") {
            found = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert!(found, "registered instance never showed up");

    client
        .naming()
        .deregister_instance("it-orders", "DEFAULT_GROUP", Instance::new("10.1.1.1", 8080))
        .await
        .unwrap();
    assert!(client.redo().instances().is_empty());

    client.shutdown().await;
}

/// Test: A subscriber sees another client's registration through a push
#[tokio::test]
#[ignore]
async fn naming_subscribe_receives_push() {
    let docker = Cli::default();
    let (container, addr) = start_nacos(&docker);
    let offset = grpc_offset(&container);
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let watcher = started(nacos_config(&dir_a, &addr, offset)).await;
    let provider = started(nacos_config(&dir_b, &addr, offset)).await;

    let mut changes = watcher.service_info().subscribe_changes();
    watcher.naming().subscribe("it-pay", "DEFAULT_GROUP", &[]).await.unwrap();

    provider
        .naming()
        .register_instance("it-pay", "DEFAULT_GROUP", Instance::new("10.2.2.2", 9000))
        .await
        .unwrap();

    let event = tokio::time::timeout(WAIT, async {
        loop {
            let event = changes.recv().await.unwrap();
            if event.hosts.iter().any(|h| h.ip == "10.2.2.2") {
                return event;
            }
        }
    })
    .await
    .expect("no push for the new instance");
    assert_eq!(event.service_name, "it-pay");

    let healthy = watcher
        .naming()
        .select_instances("it-pay", "DEFAULT_GROUP", &[], true)
        .await
        .unwrap();
    assert_eq!(healthy.len(), 1);

    provider.shutdown().await;
    watcher.shutdown().await;
}

/// Test: Persistent instances go through the HTTP API
#[tokio::test]
#[ignore]
async fn naming_persistent_instance() {
    let docker = Cli::default();
    let (container, addr) = start_nacos(&docker);
    let dir = TempDir::new().unwrap();
    let client = started(nacos_config(&dir, &addr, grpc_offset(&container))).await;

    let instance = Instance::new("10.3.3.3", 7000).persistent();
    client
        .naming()
        .register_instance("it-db", "DEFAULT_GROUP", instance.clone())
        .await
        .unwrap();
    // Persistent registrations are not redo intents.
    assert!(client.redo().instances().is_empty());

    client
        .naming()
        .deregister_instance("it-db", "DEFAULT_GROUP", instance)
        .await
        .unwrap();

    client.shutdown().await;
}

// =============================================================================
// Config
// =============================================================================

struct Forward(mpsc::UnboundedSender<ConfigChangeEvent>);

impl ConfigChangeListener for Forward {
    fn on_change(&self, event: &ConfigChangeEvent) {
        let _ = self.0.send(event.clone());
    }
}

/// Test: Publish, read back, and get notified of a change
#[tokio::test]
#[ignore]
async fn config_publish_get_and_listen() {
    let docker = Cli::default();
    let (container, addr) = start_nacos(&docker);
    let dir = TempDir::new().unwrap();
    let client = started(nacos_config(&dir, &addr, grpc_offset(&container))).await;
    let configs = client.configs();

    assert!(configs
        .publish_config("it.properties", "DEFAULT_GROUP", "a=1", Some("properties"))
        .await
        .unwrap());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        configs.get_config("it.properties", "DEFAULT_GROUP").await.unwrap().as_deref(),
        Some("a=1")
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    configs
        .add_listener("it.properties", "DEFAULT_GROUP", Arc::new(Forward(tx)))
        .await
        .unwrap();

    configs
        .publish_config("it.properties", "DEFAULT_GROUP", "a=2", Some("properties"))
        .await
        .unwrap();
    let event = tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no change notification")
        .unwrap();
    assert_eq!(event.new_content.as_deref(), Some("a=2"));

    assert!(configs.remove_config("it.properties", "DEFAULT_GROUP").await.unwrap());
    client.shutdown().await;
}
