//! Broker assembly: configuration, presence tracking and the tunnel
//! registry wired together.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use burrow_core::{CallContext, Config};

use crate::registry::{RegistryLoop, TunnelRegistry};
use crate::server::TunnelServiceImpl;
use crate::tracker::{InMemoryTracker, TunnelTracker};

pub struct Broker {
    config: Config,
    tracker: Arc<dyn TunnelTracker>,
    registry: TunnelRegistry,
    control: RegistryLoop,
}

impl Broker {
    /// Build a broker that tracks tunnel presence in memory.
    pub fn new(config: Config) -> burrow_core::Result<Self> {
        Self::with_tracker(config, Arc::new(InMemoryTracker::new()))
    }

    /// Build a broker that reports tunnel presence to `tracker`.
    pub fn with_tracker(
        config: Config,
        tracker: Arc<dyn TunnelTracker>,
    ) -> burrow_core::Result<Self> {
        config.validate()?;
        let (registry, control) = TunnelRegistry::new(
            Arc::clone(&tracker),
            &config.broker.private_api_url,
            config.broker.command_queue_size,
        );
        Ok(Self {
            config,
            tracker,
            registry,
            control,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<dyn TunnelTracker> {
        &self.tracker
    }

    /// Handle to the registry, for finding tunnels to forward calls through.
    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    /// The agent-facing `Connect` service. Tunnels it serves are closed
    /// when `shutdown` fires.
    pub fn tunnel_service(&self, shutdown: &CancellationToken) -> TunnelServiceImpl {
        TunnelServiceImpl::new(
            self.registry.clone(),
            self.config.tunnel.clone(),
            CallContext::new(shutdown.child_token()),
        )
    }

    /// Run the registry until `shutdown` fires. Every tunnel and pending
    /// find request still held is aborted before this returns.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            broker_url = %self.config.broker.private_api_url,
            "Broker running"
        );
        self.control.run(CallContext::new(shutdown)).await;
        info!("Broker stopped");
    }
}
