//! Burrow Agent Library
//!
//! The agent end of the reverse tunnel:
//! - Keeps a pool of `Connect` streams open to the broker
//! - Describes itself on each of them and waits for a proxied call
//! - Runs that call against a local server and streams the response back

pub mod agent;
pub mod connection;
pub mod local;

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
pub(crate) mod test_helpers;

pub use agent::TunnelAgent;
pub use connection::Connection;
pub use local::{
    ConnectRequests, ConnectResponses, LocalFrame, LocalFrames, LocalResponse, LocalServer,
    RequestFrames, TunnelConnector,
};
