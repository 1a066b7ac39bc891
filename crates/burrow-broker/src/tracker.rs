//! Presence tracking of registered tunnels.
//!
//! The registry reports every tunnel it starts or stops holding, so that
//! other broker instances can find out where an agent is connected.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use burrow_proto::v1::TunnelInfo;

/// Receives tunnel presence changes from the registry.
///
/// Called from the registry's control loop, so implementations must not
/// block.
pub trait TunnelTracker: Send + Sync {
    fn register_tunnel(&self, info: &TunnelInfo);

    fn unregister_tunnel(&self, info: &TunnelInfo);
}

/// Tracker that keeps presence in process memory.
#[derive(Default)]
pub struct InMemoryTracker {
    // agent id -> connection id -> info
    tunnels: Mutex<HashMap<i64, HashMap<i64, TunnelInfo>>>,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// All tunnels currently known for `agent_id`, in no particular order.
    pub fn tunnels_by_agent_id(&self, agent_id: i64) -> Vec<TunnelInfo> {
        self.tunnels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&agent_id)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn agent_count(&self) -> usize {
        self.tunnels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl TunnelTracker for InMemoryTracker {
    fn register_tunnel(&self, info: &TunnelInfo) {
        debug!(
            agent_id = info.agent_id,
            connection_id = info.connection_id,
            "Tracking tunnel"
        );
        self.tunnels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(info.agent_id)
            .or_default()
            .insert(info.connection_id, info.clone());
    }

    fn unregister_tunnel(&self, info: &TunnelInfo) {
        debug!(
            agent_id = info.agent_id,
            connection_id = info.connection_id,
            "Untracking tunnel"
        );
        let mut tunnels = self.tunnels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(conns) = tunnels.get_mut(&info.agent_id) {
            conns.remove(&info.connection_id);
            if conns.is_empty() {
                tunnels.remove(&info.agent_id);
            }
        }
    }
}
