// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport-neutral connection seam.
//!
//! [`ConnectionManager`](super::lifecycle::ConnectionManager) only sees these
//! traits. The production implementation is [`GrpcConnector`](super::grpc::GrpcConnector);
//! tests plug in an in-memory server.

use super::payload::Payload;
use crate::error::BoxFuture;
use crate::server_list::ServerEndpoint;
use std::sync::Arc;
use std::time::Duration;

/// What the server check returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerCheckInfo {
    pub connection_id: String,
    pub support_ability_negotiation: bool,
}

/// One established connection: a unary request path plus a bi-directional
/// stream for setup, server pushes and push acknowledgements.
pub trait RpcConnection: Send + Sync {
    fn connection_id(&self) -> &str;

    /// Address of the server (HTTP port, as configured).
    fn server(&self) -> &str;

    /// Unary request/response.
    fn request<'a>(&'a self, payload: Payload, timeout: Duration) -> BoxFuture<'a, Payload>;

    /// Write a message on the stream.
    fn send<'a>(&'a self, payload: Payload) -> BoxFuture<'a, ()>;

    /// Next message pushed by the server. `Ok(None)` once the stream is closed.
    fn next_push<'a>(&'a self) -> BoxFuture<'a, Option<Payload>>;

    /// Tear the connection down. Idempotent.
    fn close(&self);
}

/// Opens connections. Performs the server check before returning.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, server: &'a ServerEndpoint) -> BoxFuture<'a, (Arc<dyn RpcConnection>, ServerCheckInfo)>;
}
