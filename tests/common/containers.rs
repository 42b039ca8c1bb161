// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Nacos testcontainer setup.
//!
//! Requires Docker. Tests using these helpers are `#[ignore]`d by default.

use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

pub const NACOS_IMAGE: &str = "nacos/nacos-server";
pub const NACOS_TAG: &str = "v2.3.2";
pub const NACOS_HTTP_PORT: u16 = 8848;
pub const NACOS_GRPC_PORT: u16 = 9848;

/// Standalone server with auth disabled.
pub fn nacos_image() -> GenericImage {
    GenericImage::new(NACOS_IMAGE, NACOS_TAG)
        .with_env_var("MODE", "standalone")
        .with_env_var("NACOS_AUTH_ENABLE", "false")
        .with_exposed_port(NACOS_HTTP_PORT)
        .with_exposed_port(NACOS_GRPC_PORT)
        .with_wait_for(WaitFor::message_on_stdout("Nacos started successfully"))
}

/// Start a server and return it with its `host:port` HTTP address.
///
/// The gRPC port is mapped separately, so callers must set
/// `transport.grpc_port_offset` from [`grpc_offset`].
pub fn start_nacos(docker: &Cli) -> (Container<'_, GenericImage>, String) {
    let container = docker.run(nacos_image());
    let port = container.get_host_port_ipv4(NACOS_HTTP_PORT);
    (container, format!("127.0.0.1:{}", port))
}

/// Offset between the mapped HTTP and gRPC ports.
pub fn grpc_offset(container: &Container<'_, GenericImage>) -> u16 {
    let http = container.get_host_port_ipv4(NACOS_HTTP_PORT);
    let grpc = container.get_host_port_ipv4(NACOS_GRPC_PORT);
    grpc.wrapping_sub(http)
}
