//! gRPC-facing services of the broker.

pub mod tunnel_svc;

pub use tunnel_svc::{ConnectResponseStream, TunnelServiceImpl, extract_agent_info};
