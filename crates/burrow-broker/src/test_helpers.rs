//! Shared test helpers for the tunnel, registry and service tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;
use tonic::metadata::MetadataMap;

use burrow_core::CallContext;
use burrow_proto::v1::{
    AgentDescriptor, ConnectRequest, ConnectResponse, Method, Service, TunnelInfo, Values,
};

use crate::tracker::TunnelTracker;
use crate::tunnel::{IncomingStream, Tunnel, TunnelDataCallback, TunnelStream};

pub const TEST_SERVICE: &str = "burrow.test.Echo";
pub const TEST_METHOD: &str = "Say";
pub const TEST_FULL_METHOD: &str = "/burrow.test.Echo/Say";

/// Upper bound for anything a test waits on.
pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_descriptor() -> AgentDescriptor {
    AgentDescriptor {
        services: vec![Service {
            name: TEST_SERVICE.into(),
            methods: vec![Method {
                name: TEST_METHOD.into(),
            }],
        }],
    }
}

pub fn meta(pairs: &[(&str, &str)]) -> HashMap<String, Values> {
    let mut result: HashMap<String, Values> = HashMap::new();
    for (k, v) in pairs {
        result
            .entry((*k).to_owned())
            .or_default()
            .value
            .push((*v).to_owned());
    }
    result
}

/// The agent's end of a tunnel.
pub struct AgentEnd {
    /// Frames the agent sends to the broker.
    pub to_broker: mpsc::Sender<Result<ConnectRequest, Status>>,
    /// Frames the broker sends to the agent.
    pub from_broker: mpsc::Receiver<Result<ConnectResponse, Status>>,
}

impl AgentEnd {
    pub async fn send(&self, frame: ConnectRequest) {
        self.to_broker.send(Ok(frame)).await.unwrap();
    }

    pub async fn recv(&mut self) -> ConnectResponse {
        tokio::time::timeout(TIMEOUT, self.from_broker.recv())
            .await
            .expect("timed out waiting for a broker frame")
            .expect("broker closed the tunnel")
            .expect("broker sent an error")
    }
}

/// A connected tunnel stream pair, as the `Connect` handler would see it.
pub fn tunnel_stream() -> (TunnelStream, AgentEnd) {
    let (to_broker, inbound_rx) = mpsc::channel(16);
    let (outbound, from_broker) = mpsc::channel(16);
    (
        TunnelStream {
            inbound: Box::pin(ReceiverStream::new(inbound_rx)),
            outbound,
        },
        AgentEnd {
            to_broker,
            from_broker,
        },
    )
}

/// A ready tunnel that skipped registration.
pub fn test_tunnel(
    agent_id: i64,
) -> (Tunnel, AgentEnd, oneshot::Receiver<Result<(), Status>>) {
    let (stream, agent) = tunnel_stream();
    let (ret_tx, ret_rx) = oneshot::channel();
    let info = TunnelInfo {
        agent_descriptor: Some(test_descriptor()),
        connection_id: 1,
        agent_id,
        broker_url: "grpc://127.0.0.1:8155".into(),
    };
    let tunnel = Tunnel::new(info, test_descriptor(), stream.inbound, stream.outbound, ret_tx);
    (tunnel, agent, ret_rx)
}

/// An inbound call whose request messages are fed through the returned sender.
pub fn incoming_call(
    method: &str,
    metadata: MetadataMap,
) -> (IncomingStream, mpsc::Sender<Result<Vec<u8>, Status>>) {
    let (tx, rx) = mpsc::channel(16);
    (
        IncomingStream {
            method: method.into(),
            metadata,
            frames: Box::pin(ReceiverStream::new(rx)),
            ctx: CallContext::background(),
        },
        tx,
    )
}

/// Records everything the agent sends back.
#[derive(Default)]
pub struct RecordingCallback {
    pub events: Mutex<Vec<String>>,
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

fn describe(meta: &MetadataMap) -> String {
    let mut pairs: Vec<String> = meta
        .iter()
        .filter_map(|entry| match entry {
            tonic::metadata::KeyAndValueRef::Ascii(k, v) => {
                Some(format!("{}={}", k.as_str(), v.to_str().unwrap_or_default()))
            }
            tonic::metadata::KeyAndValueRef::Binary(..) => None,
        })
        .collect();
    pairs.sort();
    pairs.join(",")
}

#[tonic::async_trait]
impl TunnelDataCallback for RecordingCallback {
    async fn header(&self, meta: MetadataMap) -> Result<(), Status> {
        self.events
            .lock()
            .unwrap()
            .push(format!("header:{}", describe(&meta)));
        Ok(())
    }

    async fn message(&self, data: Vec<u8>) -> Result<(), Status> {
        self.events
            .lock()
            .unwrap()
            .push(format!("message:{}", String::from_utf8_lossy(&data)));
        Ok(())
    }

    async fn trailer(&self, meta: MetadataMap) {
        self.events
            .lock()
            .unwrap()
            .push(format!("trailer:{}", describe(&meta)));
    }
}

/// Tracker that records calls in order.
#[derive(Default)]
pub struct RecordingTracker {
    pub calls: Mutex<Vec<(&'static str, i64)>>,
}

impl RecordingTracker {
    pub fn calls(&self) -> Vec<(&'static str, i64)> {
        self.calls.lock().unwrap().clone()
    }
}

impl TunnelTracker for RecordingTracker {
    fn register_tunnel(&self, info: &TunnelInfo) {
        self.calls
            .lock()
            .unwrap()
            .push(("register", info.connection_id));
    }

    fn unregister_tunnel(&self, info: &TunnelInfo) {
        self.calls
            .lock()
            .unwrap()
            .push(("unregister", info.connection_id));
    }
}
