//! The agent: a fixed pool of reverse tunnels to the broker.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{info, warn};

use burrow_core::CallContext;
use burrow_core::config::AgentConfig;
use burrow_proto::v1::AgentDescriptor;

use crate::connection::Connection;
use crate::local::{LocalServer, TunnelConnector};

pub struct TunnelAgent {
    config: AgentConfig,
    connection: Arc<Connection>,
}

impl TunnelAgent {
    pub fn new(
        config: AgentConfig,
        descriptor: AgentDescriptor,
        connector: Arc<dyn TunnelConnector>,
        local: Arc<dyn LocalServer>,
    ) -> burrow_core::Result<Self> {
        config.validate()?;
        let connection = Arc::new(Connection::new(
            descriptor,
            connector,
            local,
            config.clone(),
        ));
        Ok(Self { config, connection })
    }

    /// Keep `num_connections` tunnels open until `ctx` is done.
    pub async fn run(&self, ctx: CallContext) {
        info!(
            connections = self.config.num_connections,
            "Agent running"
        );
        let mut tunnels = JoinSet::new();
        for _ in 0..self.config.num_connections {
            let connection = Arc::clone(&self.connection);
            let ctx = ctx.clone();
            tunnels.spawn(async move { connection.run(ctx).await });
        }
        while let Some(joined) = tunnels.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Tunnel task failed");
            }
        }
        info!("Agent stopped");
    }
}
