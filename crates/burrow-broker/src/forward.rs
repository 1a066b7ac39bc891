//! Routing an inbound call to an agent through one of its tunnels.

use std::sync::Arc;

use tonic::Status;
use tracing::debug;

use burrow_proto::v1::info::split_method_name;

use crate::registry::TunnelRegistry;
use crate::tunnel::{IncomingStream, TunnelDataCallback};

/// Wait for a tunnel to `agent_id` and forward `incoming` through it.
///
/// Fails with `unimplemented` when the agent did not advertise the called
/// method; the tunnel is released unused in that case. The wait for a tunnel
/// is bounded by `incoming.ctx`.
pub async fn forward_to_agent(
    registry: &TunnelRegistry,
    agent_id: i64,
    incoming: IncomingStream,
    cb: Arc<dyn TunnelDataCallback>,
) -> Result<(), Status> {
    let (service, method) = split_method_name(&incoming.method).ok_or_else(|| {
        Status::invalid_argument(format!("Malformed method name {:?}", incoming.method))
    })?;

    let mut tunnel = registry.find_tunnel(&incoming.ctx, agent_id).await?;
    if !tunnel.descriptor().supports_service_and_method(service, method) {
        debug!(
            agent_id,
            connection_id = tunnel.connection_id(),
            method = %incoming.method,
            "Agent does not serve method"
        );
        tunnel.done();
        return Err(Status::unimplemented(format!(
            "Agent {agent_id} does not support method {}",
            incoming.method
        )));
    }
    tunnel.forward_stream(incoming, cb).await
}
