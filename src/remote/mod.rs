// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! gRPC remoting: envelope codec, connection seam, lifecycle.

pub mod connection;
pub mod grpc;
pub mod lifecycle;
pub mod messages;
pub mod payload;

pub use connection::{Connector, RpcConnection, ServerCheckInfo};
pub use grpc::GrpcConnector;
pub use lifecycle::{
    ConnectionEventListener, ConnectionManager, ConnectionSettings, ConnectionState, ServerRequestHandler,
};
pub use payload::{Payload, RemoteMessage};
