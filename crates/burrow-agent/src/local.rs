//! The two ends an agent connects: the broker it dials out to, and the local
//! server that actually handles proxied calls.

use std::pin::Pin;

use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;
use tonic::metadata::MetadataMap;

use burrow_proto::v1::{ConnectRequest, ConnectResponse};

/// Frames the agent writes into a tunnel.
pub type ConnectRequests = ReceiverStream<ConnectRequest>;

/// Frames the broker writes into a tunnel.
pub type ConnectResponses = Pin<Box<dyn Stream<Item = Result<ConnectResponse, Status>> + Send>>;

/// Raw request messages of a proxied call. Ends when the caller is done
/// sending.
pub type RequestFrames = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// What the local server produces after the response header.
pub type LocalFrames = Pin<Box<dyn Stream<Item = Result<LocalFrame, Status>> + Send>>;

/// Opens `Connect` calls to the broker.
#[tonic::async_trait]
pub trait TunnelConnector: Send + Sync {
    /// Start a `Connect` call that sends `requests` and returns the broker's
    /// half of the stream.
    async fn connect(&self, requests: ConnectRequests) -> Result<ConnectResponses, Status>;
}

/// The server proxied calls are delivered to.
#[tonic::async_trait]
pub trait LocalServer: Send + Sync {
    /// Start a call to `method` (`/package.Service/Method`).
    ///
    /// Resolves once the response header is known. An error here is the
    /// status of the whole call.
    async fn call(
        &self,
        method: &str,
        metadata: MetadataMap,
        requests: RequestFrames,
    ) -> Result<LocalResponse, Status>;
}

#[derive(Debug, Clone)]
pub enum LocalFrame {
    Message(Vec<u8>),
    /// Ends the response; anything after it is ignored.
    Trailer(MetadataMap),
}

pub struct LocalResponse {
    pub header: MetadataMap,
    /// A stream that ends without a trailer gets an empty one.
    pub frames: LocalFrames,
}
