//! gRPC stream tooling for burrow.
//!
//! - [`StreamVisitor`]: walks a stream of oneof-shaped messages, enforcing a
//!   declared transition graph and dispatching one callback per frame kind
//! - [`Transitions`]: the declarative grammar a visitor is built from
//! - status helpers shared by the broker's stream handlers

pub mod status;
pub mod stream_visitor;
pub mod transitions;

pub use status::{is_peer_disconnect, request_cancelled};
pub use stream_visitor::{
    BoxFuture, Callbacks, FramePayload, InvalidTransition, OneofFrame, StreamVisitor,
};
pub use transitions::{GrammarError, State, Transitions};
