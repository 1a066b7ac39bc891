//! Reverse tunnel `Connect` service implementation.

use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};

use burrow_core::CallContext;
use burrow_core::config::TunnelConfig;
use burrow_grpctool::is_peer_disconnect;
use burrow_proto::v1::{ConnectRequest, ConnectResponse};

use crate::registry::TunnelRegistry;
use crate::tunnel::{AgentInfo, TunnelStream};

/// Response stream of `Connect`: what the broker sends into the tunnel.
pub type ConnectResponseStream =
    Pin<Box<dyn Stream<Item = Result<ConnectResponse, Status>> + Send>>;

pub struct TunnelServiceImpl {
    registry: TunnelRegistry,
    config: TunnelConfig,
    ctx: CallContext,
}

impl TunnelServiceImpl {
    /// `ctx` bounds every tunnel served; cancel it on shutdown.
    pub fn new(registry: TunnelRegistry, config: TunnelConfig, ctx: CallContext) -> Self {
        Self {
            registry,
            config,
            ctx,
        }
    }

    /// Serve one agent's `Connect` call.
    ///
    /// The request must carry an [`AgentInfo`] extension, put there by the
    /// authentication layer. Each tunnel lives at most for the configured
    /// maximum connection age plus jitter, after which it is unregistered
    /// and the agent reconnects.
    #[instrument(skip(self, request), fields(rpc = "Connect"))]
    pub async fn connect<S>(
        &self,
        request: Request<S>,
    ) -> Result<Response<ConnectResponseStream>, Status>
    where
        S: Stream<Item = Result<ConnectRequest, Status>> + Send + 'static,
    {
        let agent = extract_agent_info(&request)?;
        let inbound = request.into_inner();

        let (out_tx, out_rx) = mpsc::channel(self.config.outbound_buffer.max(1));
        let stream = TunnelStream {
            inbound: Box::pin(inbound),
            outbound: out_tx.clone(),
        };
        let max_age = self.config.max_connection_age_with_jitter();
        let ctx = self.ctx.with_timeout(max_age);
        let registry = self.registry.clone();
        debug!(agent_id = agent.id, ?max_age, "Agent connected");

        tokio::spawn(async move {
            if let Err(status) = registry.handle_tunnel(&ctx, &agent, stream).await {
                if is_peer_disconnect(&status) {
                    debug!(agent_id = agent.id, error = %status, "Tunnel closed by agent");
                } else {
                    warn!(agent_id = agent.id, error = %status, "Tunnel ended with error");
                }
                let _ = out_tx.send(Err(status)).await;
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(out_rx))))
    }
}

/// Agent identity of an authenticated request.
#[allow(clippy::result_large_err)]
pub fn extract_agent_info<T>(req: &Request<T>) -> Result<AgentInfo, Status> {
    req.extensions()
        .get::<AgentInfo>()
        .copied()
        .ok_or_else(|| Status::unauthenticated("Agent identity not found in request"))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
#[path = "tunnel_svc_tests.rs"]
mod tests;
