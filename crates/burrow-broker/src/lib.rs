//! Burrow Broker Library
//!
//! Core functionality for the burrow broker:
//! - Tunnels: agent-initiated duplex streams that carry one proxied call each
//! - Tunnel registry: a single control loop matching tunnels to requests
//! - Presence tracking of registered tunnels
//! - The agent-facing tunnel service and request forwarding into tunnels

pub mod broker;
pub mod forward;
pub mod registry;
pub mod server;
pub mod tracker;
pub mod tunnel;

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
pub(crate) mod test_helpers;

pub use broker::Broker;
pub use registry::{RegistryError, RegistryLoop, RegistryStats, TunnelRegistry};
pub use tracker::{InMemoryTracker, TunnelTracker};
pub use tunnel::{AgentInfo, IncomingStream, Tunnel, TunnelDataCallback, TunnelStream};
