pub mod info;
pub mod metadata;
pub mod rpc;
pub mod tracker;

pub use info::{AgentDescriptor, Method, Service};
pub use metadata::{Values, meta_to_values_map, values_map_to_meta};
pub use rpc::{
    CloseSend, ConnectRequest, ConnectRequestKind, ConnectResponse, ConnectResponseKind,
    Descriptor, Error, Header, Message, RequestInfo, RpcStatus, Trailer, connect_request,
    connect_response,
};
pub use tracker::TunnelInfo;

use crate::error::ValidationError;

/// Field constraints checked on messages received from peers.
pub trait Validate {
    fn validate(&self) -> Result<(), ValidationError>;
}
