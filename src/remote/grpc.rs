// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! tonic implementation of [`Connector`] / [`RpcConnection`].
//!
//! The server exposes two methods, both carrying [`Payload`]:
//!
//! - `/Request/request`: unary, used for every client-initiated request
//! - `/BiRequestStream/requestBiStream`: bi-directional, used for the setup
//!   message, server pushes and the client's answers to them
//!
//! The gRPC port is the configured HTTP port plus `grpc_port_offset`.
//!
//! The stream is driven by a spawned task: outbound messages go through an
//! mpsc channel that backs the request body, inbound messages are forwarded to
//! a second channel that [`RpcConnection::next_push()`] reads. When the task
//! ends (server closed the stream, transport error, or `close()`), the push
//! channel closes and the lifecycle sees `Ok(None)`.

use super::connection::{Connector, RpcConnection, ServerCheckInfo};
use super::messages::{ServerCheckRequest, ServerCheckResponse};
use super::payload::{decode_response, encode, next_request_id, Payload};
use crate::config::TransportConfig;
use crate::error::{BoxFuture, ClientError, Result};
use crate::server_list::ServerEndpoint;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;
use tracing::{debug, info, warn};

const REQUEST_PATH: &str = "/Request/request";
const BI_STREAM_PATH: &str = "/BiRequestStream/requestBiStream";

/// Stream buffer in both directions.
const STREAM_BUFFER: usize = 64;

fn status_error(server: &str, status: tonic::Status) -> ClientError {
    match ClientError::from(status) {
        ClientError::Transient { message, .. } => ClientError::transient(server, message),
        other => other,
    }
}

async fn unary(mut grpc: Grpc<Channel>, payload: Payload, timeout: Duration, server: &str) -> Result<Payload> {
    grpc.ready()
        .await
        .map_err(|e| ClientError::transient(server, format!("channel not ready: {}", e)))?;

    let mut request = Request::new(payload);
    request.set_timeout(timeout);
    let codec: ProstCodec<Payload, Payload> = ProstCodec::default();
    let call = grpc.unary(request, PathAndQuery::from_static(REQUEST_PATH), codec);

    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(response)) => Ok(response.into_inner()),
        Ok(Err(status)) => Err(status_error(server, status)),
        Err(_) => Err(ClientError::transient(
            server,
            format!("request timed out after {}ms", timeout.as_millis()),
        )),
    }
}

/// Connects over gRPC using [`TransportConfig`] timeouts and port offset.
pub struct GrpcConnector {
    port_offset: u16,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl GrpcConnector {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            port_offset: config.grpc_port_offset,
            connect_timeout: config.connect_timeout_duration(),
            request_timeout: config.request_timeout_duration(),
        }
    }

    async fn open(&self, server: &ServerEndpoint) -> Result<(Arc<dyn RpcConnection>, ServerCheckInfo)> {
        let grpc_address = server.grpc_address(self.port_offset);
        let uri = format!("http://{}", grpc_address);

        let channel = Endpoint::from_shared(uri)
            .map_err(|e| ClientError::Config(format!("invalid gRPC address {}: {}", grpc_address, e)))?
            .connect_timeout(self.connect_timeout)
            .connect()
            .await
            .map_err(|e| ClientError::transient(&grpc_address, e.to_string()))?;
        let grpc = Grpc::new(channel);

        let check = encode(
            &ServerCheckRequest {
                request_id: next_request_id(),
                ..Default::default()
            },
            "",
        )?;
        let answer = unary(grpc.clone(), check, self.request_timeout, &grpc_address).await?;
        let check: ServerCheckResponse = decode_response(&answer, &grpc_address)?;
        debug!(
            server = %grpc_address,
            connection_id = %check.connection_id,
            negotiation = check.support_ability_negotiation,
            "Server check passed"
        );

        let (outbound_tx, outbound_rx) = mpsc::channel(STREAM_BUFFER);
        let (push_tx, push_rx) = mpsc::channel(STREAM_BUFFER);
        let stream_task = tokio::spawn(drive_stream(
            grpc.clone(),
            outbound_rx,
            push_tx,
            grpc_address.clone(),
            check.connection_id.clone(),
        ));

        info!(server = %grpc_address, connection_id = %check.connection_id, "gRPC connection opened");

        let connection = GrpcConnection {
            connection_id: check.connection_id.clone(),
            server: server.address().to_string(),
            grpc,
            outbound: outbound_tx,
            inbound: Mutex::new(push_rx),
            stream_task,
        };
        let info = ServerCheckInfo {
            connection_id: check.connection_id,
            support_ability_negotiation: check.support_ability_negotiation,
        };
        Ok((Arc::new(connection), info))
    }
}

impl Connector for GrpcConnector {
    fn connect<'a>(&'a self, server: &'a ServerEndpoint) -> BoxFuture<'a, (Arc<dyn RpcConnection>, ServerCheckInfo)> {
        Box::pin(self.open(server))
    }
}

/// Runs the bi-directional stream until either side closes it.
async fn drive_stream(
    mut grpc: Grpc<Channel>,
    outbound: mpsc::Receiver<Payload>,
    pushes: mpsc::Sender<Payload>,
    server: String,
    connection_id: String,
) {
    if let Err(e) = grpc.ready().await {
        warn!(server = %server, error = %e, "Stream channel not ready");
        return;
    }

    let codec: ProstCodec<Payload, Payload> = ProstCodec::default();
    let request = Request::new(ReceiverStream::new(outbound));
    let mut inbound = match grpc
        .streaming(request, PathAndQuery::from_static(BI_STREAM_PATH), codec)
        .await
    {
        Ok(response) => response.into_inner(),
        Err(status) => {
            warn!(server = %server, code = ?status.code(), message = %status.message(), "Failed to open stream");
            return;
        }
    };

    loop {
        match inbound.message().await {
            Ok(Some(payload)) => {
                if pushes.send(payload).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!(server = %server, connection_id = %connection_id, "Server closed the stream");
                break;
            }
            Err(status) => {
                warn!(
                    server = %server,
                    connection_id = %connection_id,
                    code = ?status.code(),
                    message = %status.message(),
                    "Stream error"
                );
                break;
            }
        }
    }
}

/// A live gRPC connection.
pub struct GrpcConnection {
    connection_id: String,
    server: String,
    grpc: Grpc<Channel>,
    outbound: mpsc::Sender<Payload>,
    inbound: Mutex<mpsc::Receiver<Payload>>,
    stream_task: JoinHandle<()>,
}

impl RpcConnection for GrpcConnection {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn server(&self) -> &str {
        &self.server
    }

    fn request<'a>(&'a self, payload: Payload, timeout: Duration) -> BoxFuture<'a, Payload> {
        Box::pin(unary(self.grpc.clone(), payload, timeout, &self.server))
    }

    fn send<'a>(&'a self, payload: Payload) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.outbound
                .send(payload)
                .await
                .map_err(|_| ClientError::Disconnected(format!("stream to {} is closed", self.server)))
        })
    }

    fn next_push<'a>(&'a self) -> BoxFuture<'a, Option<Payload>> {
        Box::pin(async move { Ok(self.inbound.lock().await.recv().await) })
    }

    fn close(&self) {
        self.stream_task.abort();
    }
}

impl Drop for GrpcConnection {
    fn drop(&mut self) {
        self.stream_task.abort();
    }
}
