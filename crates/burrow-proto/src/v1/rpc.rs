//! The reverse tunnel protocol.
//!
//! An agent opens a `Connect` stream to the broker and becomes a tunnel.
//! The agent writes [`ConnectRequest`] frames (a [`Descriptor`] first, then
//! the response of one proxied call) and reads [`ConnectResponse`] frames
//! (the proxied request). Both directions follow a fixed frame order,
//! declared here through [`OneofFrame`].

use std::collections::HashMap;

use burrow_grpctool::{FramePayload, OneofFrame, Transitions};
use prost::Message as _;
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};

use super::info::AgentDescriptor;
use super::metadata::{Values, values_map_to_meta};
use super::Validate;
use crate::error::ValidationError;

/// A frame written by the agent.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectRequest {
    #[prost(oneof = "connect_request::Msg", tags = "1, 2, 3, 4, 5")]
    pub msg: Option<connect_request::Msg>,
}

pub mod connect_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "1")]
        Descriptor(super::Descriptor),
        #[prost(message, tag = "2")]
        Header(super::Header),
        #[prost(message, tag = "3")]
        Message(super::Message),
        #[prost(message, tag = "4")]
        Trailer(super::Trailer),
        #[prost(message, tag = "5")]
        Error(super::Error),
    }
}

/// A frame written by the broker.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectResponse {
    #[prost(oneof = "connect_response::Msg", tags = "1, 2, 3")]
    pub msg: Option<connect_response::Msg>,
}

pub mod connect_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "1")]
        RequestInfo(super::RequestInfo),
        #[prost(message, tag = "2")]
        Message(super::Message),
        #[prost(message, tag = "3")]
        CloseSend(super::CloseSend),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Descriptor {
    #[prost(message, optional, tag = "1")]
    pub agent_descriptor: Option<AgentDescriptor>,
}

/// Response headers of the proxied call.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Header {
    #[prost(map = "string, message", tag = "1")]
    pub meta: HashMap<String, Values>,
}

/// One raw message of the proxied call, in either direction.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
}

/// Response trailers of the proxied call.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Trailer {
    #[prost(map = "string, message", tag = "1")]
    pub meta: HashMap<String, Values>,
}

/// The proxied call failed on the agent side.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
    #[prost(message, optional, tag = "1")]
    pub status: Option<RpcStatus>,
}

/// The proxied call: which method, and the caller's request metadata.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestInfo {
    #[prost(string, tag = "1")]
    pub method_name: String,
    #[prost(map = "string, message", tag = "2")]
    pub meta: HashMap<String, Values>,
}

/// The caller finished sending.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CloseSend {}

/// Wire-compatible with `google.rpc.Status`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, repeated, tag = "3")]
    pub details: Vec<prost_types::Any>,
}

impl RpcStatus {
    pub fn to_status(&self) -> Status {
        let code = Code::from_i32(self.code);
        if self.details.is_empty() {
            Status::new(code, self.message.clone())
        } else {
            Status::with_details(code, self.message.clone(), self.encode_to_vec().into())
        }
    }
}

impl From<&Status> for RpcStatus {
    fn from(status: &Status) -> Self {
        let details = Self::decode(status.details())
            .map(|s| s.details)
            .unwrap_or_default();
        Self {
            code: status.code().into(),
            message: status.message().to_owned(),
            details,
        }
    }
}

impl Header {
    pub fn metadata(&self) -> MetadataMap {
        values_map_to_meta(&self.meta)
    }
}

impl Trailer {
    pub fn metadata(&self) -> MetadataMap {
        values_map_to_meta(&self.meta)
    }
}

impl RequestInfo {
    pub fn metadata(&self) -> MetadataMap {
        values_map_to_meta(&self.meta)
    }
}

impl Validate for Descriptor {
    fn validate(&self) -> Result<(), ValidationError> {
        self.agent_descriptor
            .as_ref()
            .ok_or(ValidationError::Required {
                field: "Descriptor.AgentDescriptor",
            })?
            .validate()
    }
}

impl Validate for Error {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.status.is_none() {
            return Err(ValidationError::Required {
                field: "Error.Status",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectRequestKind {
    Descriptor,
    Header,
    Message,
    Trailer,
    Error,
}

impl OneofFrame for ConnectRequest {
    type Kind = ConnectRequestKind;
    const NAME: &'static str = "burrow.rpc.ConnectRequest.msg";
    const KINDS: &'static [ConnectRequestKind] = &[
        ConnectRequestKind::Descriptor,
        ConnectRequestKind::Header,
        ConnectRequestKind::Message,
        ConnectRequestKind::Trailer,
        ConnectRequestKind::Error,
    ];

    fn kind(&self) -> Option<ConnectRequestKind> {
        use connect_request::Msg;
        self.msg.as_ref().map(|msg| match msg {
            Msg::Descriptor(_) => ConnectRequestKind::Descriptor,
            Msg::Header(_) => ConnectRequestKind::Header,
            Msg::Message(_) => ConnectRequestKind::Message,
            Msg::Trailer(_) => ConnectRequestKind::Trailer,
            Msg::Error(_) => ConnectRequestKind::Error,
        })
    }

    fn transitions() -> Transitions<ConnectRequestKind> {
        use ConnectRequestKind::{Descriptor, Error, Header, Message, Trailer};
        Transitions::new()
            .first([Descriptor])
            .next(Descriptor, [Header, Error])
            .next(Header, [Message, Trailer, Error])
            .next(Message, [Message, Trailer, Error])
            .end(Trailer)
            .end(Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectResponseKind {
    RequestInfo,
    Message,
    CloseSend,
}

impl OneofFrame for ConnectResponse {
    type Kind = ConnectResponseKind;
    const NAME: &'static str = "burrow.rpc.ConnectResponse.msg";
    const KINDS: &'static [ConnectResponseKind] = &[
        ConnectResponseKind::RequestInfo,
        ConnectResponseKind::Message,
        ConnectResponseKind::CloseSend,
    ];

    fn kind(&self) -> Option<ConnectResponseKind> {
        use connect_response::Msg;
        self.msg.as_ref().map(|msg| match msg {
            Msg::RequestInfo(_) => ConnectResponseKind::RequestInfo,
            Msg::Message(_) => ConnectResponseKind::Message,
            Msg::CloseSend(_) => ConnectResponseKind::CloseSend,
        })
    }

    fn transitions() -> Transitions<ConnectResponseKind> {
        use ConnectResponseKind::{CloseSend, Message, RequestInfo};
        Transitions::new()
            .first([RequestInfo])
            .next(RequestInfo, [Message, CloseSend])
            .next(Message, [Message, CloseSend])
            .end(CloseSend)
    }
}

macro_rules! frame_payload {
    ($frame:ident, $module:ident, $kind:ident, $($variant:ident),+ $(,)?) => {
        $(
            impl FramePayload<$frame> for $variant {
                const KIND: $kind = $kind::$variant;

                fn from_frame(frame: $frame) -> Option<Self> {
                    match frame.msg {
                        Some($module::Msg::$variant(payload)) => Some(payload),
                        _ => None,
                    }
                }
            }
        )+
    };
}

// `Message` travels in both directions and is a payload of both streams.
frame_payload!(
    ConnectRequest,
    connect_request,
    ConnectRequestKind,
    Descriptor,
    Header,
    Message,
    Trailer,
    Error,
);
frame_payload!(
    ConnectResponse,
    connect_response,
    ConnectResponseKind,
    RequestInfo,
    Message,
    CloseSend,
);

impl ConnectRequest {
    pub fn descriptor(agent_descriptor: AgentDescriptor) -> Self {
        Self {
            msg: Some(connect_request::Msg::Descriptor(Descriptor {
                agent_descriptor: Some(agent_descriptor),
            })),
        }
    }

    pub fn header(meta: HashMap<String, Values>) -> Self {
        Self {
            msg: Some(connect_request::Msg::Header(Header { meta })),
        }
    }

    pub fn message(data: Vec<u8>) -> Self {
        Self {
            msg: Some(connect_request::Msg::Message(Message { data })),
        }
    }

    pub fn trailer(meta: HashMap<String, Values>) -> Self {
        Self {
            msg: Some(connect_request::Msg::Trailer(Trailer { meta })),
        }
    }

    pub fn error(status: &Status) -> Self {
        Self {
            msg: Some(connect_request::Msg::Error(Error {
                status: Some(status.into()),
            })),
        }
    }
}

impl ConnectResponse {
    pub fn request_info(method_name: String, meta: HashMap<String, Values>) -> Self {
        Self {
            msg: Some(connect_response::Msg::RequestInfo(RequestInfo {
                method_name,
                meta,
            })),
        }
    }

    pub fn message(data: Vec<u8>) -> Self {
        Self {
            msg: Some(connect_response::Msg::Message(Message { data })),
        }
    }

    pub fn close_send() -> Self {
        Self {
            msg: Some(connect_response::Msg::CloseSend(CloseSend {})),
        }
    }
}
