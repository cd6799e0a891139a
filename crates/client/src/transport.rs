// Transport capability consumed by the session core.
//
// The session is written against these traits so the multiplexed wire
// implementation can live out of tree and tests can drive the session
// with a scripted mock. A production transport maps them onto the
// request-response / fire-and-forget / request-stream operations of the
// underlying protocol.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use url::Url;

use colloquy_common::protocol::routing::RouteMetadata;

/// Demand requested on a fresh inbound stream. Reactive-streams demand
/// caps at the i32 ceiling; requesting it all up front makes the stream
/// effectively unbounded, which is what a push-chat feed wants.
pub const UNBOUNDED_DEMAND: u32 = 2_147_483_647;

/// Connection-setup data carried in the transport handshake, not as a
/// message. The identity travels here so the server can attribute the
/// connection before any join handshake runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSetup {
    pub username: Option<String>,
    pub keepalive: Duration,
    pub lifetime: Duration,
    pub data_mime_type: String,
    pub metadata_mime_type: String,
}

/// Raw payload delivered on an inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPayload {
    Text(String),
    Binary(Vec<u8>),
}

/// Factory for connections to the chat server.
#[async_trait]
pub trait ChatTransport: Send + Sync + 'static {
    type Conn: ChatConnection;

    /// Open a connection, performing the transport handshake with the
    /// given setup data.
    async fn open(&self, endpoint: &Url, setup: ConnectionSetup) -> Result<Self::Conn>;
}

#[async_trait]
impl<T: ChatTransport> ChatTransport for Arc<T> {
    type Conn = T::Conn;

    async fn open(&self, endpoint: &Url, setup: ConnectionSetup) -> Result<Self::Conn> {
        T::open(self, endpoint, setup).await
    }
}

/// One established multiplexed connection.
#[async_trait]
pub trait ChatConnection: Send + Sync + 'static {
    /// Acknowledged request: resolves once the server has answered.
    async fn request_response(&self, route: RouteMetadata, payload: serde_json::Value)
        -> Result<()>;

    /// One-way send with no acknowledgment. The session prefers
    /// acknowledged sends so transport failures surface in logs.
    fn fire_and_forget(&self, route: RouteMetadata, payload: serde_json::Value) -> Result<()>;

    /// Open a server-push stream. Demand must be signalled explicitly on
    /// the returned handle before payloads flow.
    async fn request_stream(
        &self,
        route: RouteMetadata,
        payload: serde_json::Value,
    ) -> Result<Box<dyn InboundStream>>;

    /// Close the connection.
    async fn close(&self);
}

/// A server-push stream opened by [`ChatConnection::request_stream`].
#[async_trait]
pub trait InboundStream: Send {
    /// Signal demand for `n` further payloads.
    fn request(&mut self, n: u32);

    /// Next inbound payload. `None` once the stream completes cleanly;
    /// an error terminates the stream.
    async fn next(&mut self) -> Option<Result<StreamPayload>>;

    /// Cancel the stream, releasing the server-side resource.
    fn cancel(&mut self);
}
