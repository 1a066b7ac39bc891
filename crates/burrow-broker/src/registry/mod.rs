//! Tunnel registry.
//!
//! Matches agent tunnels with requests that need one. All state lives in a
//! single control loop ([`RegistryLoop`]); [`TunnelRegistry`] handles talk to
//! it over a command queue.

mod tunnel_registry;

use tonic::Status;

use burrow_core::ContextError;

pub use tunnel_registry::{RegistryLoop, TunnelRegistry};

/// Errors from [`TunnelRegistry`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The caller's context finished first.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// The control loop has stopped.
    #[error("tunnel registry is shutting down")]
    ShuttingDown,
}

impl From<RegistryError> for Status {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Context(ctx) => ctx.into(),
            RegistryError::ShuttingDown => Self::unavailable(err.to_string()),
        }
    }
}

/// Snapshot of the control loop's state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Tunnels waiting to be used.
    pub tunnels: usize,
    /// Agents with at least one waiting tunnel.
    pub agents: usize,
    /// Find requests waiting for a tunnel.
    pub pending_finds: usize,
}
