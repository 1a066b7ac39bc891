//! Agent tunnels.
//!
//! An agent keeps one or more `Connect` streams open to the broker. Each of
//! them becomes a [`Tunnel`] once the agent has described itself, waits in
//! the registry, and is then used for exactly one proxied call.

mod handle;

use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_stream::Stream;
use tonic::Status;
use tonic::metadata::MetadataMap;

use burrow_core::CallContext;
use burrow_proto::v1::{ConnectRequest, ConnectResponse};

pub use handle::{Tunnel, TunnelState};

/// Frames the agent writes into its tunnel.
pub type TunnelInbound = Pin<Box<dyn Stream<Item = Result<ConnectRequest, Status>> + Send>>;

/// Frames the broker writes into the tunnel, as the response stream of the
/// agent's `Connect` call.
pub type TunnelOutbound = mpsc::Sender<Result<ConnectResponse, Status>>;

/// Raw request messages of an inbound call.
pub type IncomingFrames = Pin<Box<dyn Stream<Item = Result<Vec<u8>, Status>> + Send>>;

/// Identity of an authenticated agent, attached to its requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgentInfo {
    pub id: i64,
}

/// Both directions of an agent's `Connect` call.
pub struct TunnelStream {
    pub inbound: TunnelInbound,
    pub outbound: TunnelOutbound,
}

/// The inbound call to forward through a tunnel.
pub struct IncomingStream {
    /// Full gRPC method name, `/package.Service/Method`.
    pub method: String,
    pub metadata: MetadataMap,
    pub frames: IncomingFrames,
    /// Done when the caller goes away.
    pub ctx: CallContext,
}

/// Receives what the agent sends back for the proxied call. Implementations
/// write it into the inbound call's response.
#[tonic::async_trait]
pub trait TunnelDataCallback: Send + Sync {
    async fn header(&self, meta: MetadataMap) -> Result<(), Status>;

    async fn message(&self, data: Vec<u8>) -> Result<(), Status>;

    async fn trailer(&self, meta: MetadataMap);
}
