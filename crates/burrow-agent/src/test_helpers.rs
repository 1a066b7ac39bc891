//! Shared test helpers: a channel-backed broker end and an echoing local
//! server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;
use tonic::metadata::MetadataMap;

use burrow_core::config::AgentConfig;
use burrow_proto::v1::{AgentDescriptor, ConnectRequest, ConnectResponse, Method, Service};

use crate::connection::Connection;
use crate::local::{
    ConnectRequests, ConnectResponses, LocalFrame, LocalResponse, LocalServer, RequestFrames,
    TunnelConnector,
};

pub const ECHO_METHOD: &str = "/burrow.test.Echo/Say";
pub const FAILING_METHOD: &str = "/burrow.test.Echo/Fail";

/// Upper bound for anything a test waits on.
pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn echo_descriptor() -> AgentDescriptor {
    AgentDescriptor {
        services: vec![Service {
            name: "burrow.test.Echo".into(),
            methods: vec![Method { name: "Say".into() }, Method { name: "Fail".into() }],
        }],
    }
}

pub fn test_config() -> AgentConfig {
    AgentConfig {
        num_connections: 1,
        connect_retry_period_ms: 10,
        frame_buffer: 16,
    }
}

/// The broker's end of one `Connect` call.
pub struct BrokerEnd {
    pub from_agent: ConnectRequests,
    pub to_agent: mpsc::Sender<Result<ConnectResponse, Status>>,
}

impl BrokerEnd {
    pub async fn recv(&mut self) -> Option<ConnectRequest> {
        tokio::time::timeout(TIMEOUT, self.from_agent.next())
            .await
            .expect("timed out waiting for an agent frame")
    }

    pub async fn send(&self, frame: ConnectResponse) {
        self.to_agent.send(Ok(frame)).await.unwrap();
    }

    /// End the broker's half of the stream; the agent's half stays readable.
    pub fn close(&mut self) {
        self.to_agent = mpsc::channel(1).0;
    }
}

/// Hands every `Connect` call to the test as a [`BrokerEnd`].
pub struct ChannelConnector {
    accepted: mpsc::Sender<BrokerEnd>,
}

impl ChannelConnector {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<BrokerEnd>) {
        let (accepted, rx) = mpsc::channel(16);
        (Arc::new(Self { accepted }), rx)
    }
}

#[tonic::async_trait]
impl TunnelConnector for ChannelConnector {
    async fn connect(&self, requests: ConnectRequests) -> Result<ConnectResponses, Status> {
        let (to_agent, rx) = mpsc::channel(16);
        self.accepted
            .send(BrokerEnd {
                from_agent: requests,
                to_agent,
            })
            .await
            .map_err(|_| Status::unavailable("broker is gone"))?;
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Echoes request metadata as the header and each request message back,
/// then ends with an `x-echoed` trailer counting the messages.
#[derive(Default)]
pub struct EchoServer {
    pub methods: Mutex<Vec<String>>,
}

#[tonic::async_trait]
impl LocalServer for EchoServer {
    async fn call(
        &self,
        method: &str,
        metadata: MetadataMap,
        requests: RequestFrames,
    ) -> Result<LocalResponse, Status> {
        self.methods.lock().unwrap().push(method.to_owned());
        if method == FAILING_METHOD {
            return Err(Status::not_found("no such thing"));
        }
        let count = Arc::new(Mutex::new(0_usize));
        let counted = Arc::clone(&count);
        let messages = requests.map(move |data| {
            *counted.lock().unwrap() += 1;
            Ok::<_, Status>(LocalFrame::Message(data))
        });
        let trailer = tokio_stream::once(()).map(move |()| {
            let mut meta = MetadataMap::new();
            let echoed = count.lock().unwrap().to_string();
            meta.insert("x-echoed", echoed.parse().unwrap());
            Ok::<_, Status>(LocalFrame::Trailer(meta))
        });
        Ok(LocalResponse {
            header: metadata,
            frames: Box::pin(messages.chain(trailer)),
        })
    }
}

pub fn connection(connector: Arc<dyn TunnelConnector>) -> (Connection, Arc<EchoServer>) {
    let local = Arc::new(EchoServer::default());
    let connection = Connection::new(
        echo_descriptor(),
        connector,
        Arc::clone(&local) as Arc<dyn LocalServer>,
        test_config(),
    );
    (connection, local)
}
