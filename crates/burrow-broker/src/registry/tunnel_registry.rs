//! The registry control loop and the handle used to talk to it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tonic::Status;
use tracing::{debug, info, warn};

use burrow_core::CallContext;
use burrow_core::id::connection_id;
use burrow_grpctool::{OneofFrame, request_cancelled};
use burrow_proto::v1::{TunnelInfo, Validate, connect_request};

use super::{RegistryError, RegistryStats};
use crate::tracker::TunnelTracker;
use crate::tunnel::{AgentInfo, Tunnel, TunnelStream};

/// A caller waiting for a tunnel to `agent_id`.
struct FindRequest {
    id: u64,
    agent_id: i64,
    reply: oneshot::Sender<Tunnel>,
}

enum RegistryCommand {
    Register(Tunnel),
    /// Connection id of a tunnel whose handler is going away.
    Unregister { agent_id: i64, connection_id: i64 },
    Find(FindRequest),
    FindAbort { agent_id: i64, request_id: u64 },
    Stats(oneshot::Sender<RegistryStats>),
}

/// Handle to the tunnel registry. Cheap to clone.
#[derive(Clone)]
pub struct TunnelRegistry {
    commands: mpsc::Sender<RegistryCommand>,
    next_request_id: Arc<AtomicU64>,
    broker_url: Arc<str>,
}

/// The registry's control loop. Owns all registry state; see
/// [`RegistryLoop::run`].
pub struct RegistryLoop {
    commands: mpsc::Receiver<RegistryCommand>,
    tracker: Arc<dyn TunnelTracker>,
    // connection id -> tunnel
    tunnels: HashMap<i64, Tunnel>,
    // agent id -> connection ids
    by_agent: HashMap<i64, HashSet<i64>>,
    // agent id -> request id -> request
    finds: HashMap<i64, HashMap<u64, FindRequest>>,
}

impl TunnelRegistry {
    /// Create a registry handle and its control loop. Nothing happens until
    /// the loop is run.
    ///
    /// `broker_url` is this instance's private API URL, published with every
    /// tunnel it registers.
    pub fn new(
        tracker: Arc<dyn TunnelTracker>,
        broker_url: &str,
        queue_size: usize,
    ) -> (Self, RegistryLoop) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let handle = Self {
            commands: tx,
            next_request_id: Arc::new(AtomicU64::new(1)),
            broker_url: broker_url.into(),
        };
        let control = RegistryLoop {
            commands: rx,
            tracker,
            tunnels: HashMap::new(),
            by_agent: HashMap::new(),
            finds: HashMap::new(),
        };
        (handle, control)
    }

    pub fn broker_url(&self) -> &str {
        &self.broker_url
    }

    /// Serve an agent's `Connect` stream.
    ///
    /// Reads the agent's descriptor, registers the tunnel and blocks until
    /// the tunnel has been used or released. Returns what the agent's call
    /// should end with. Cancelling `ctx` unregisters a tunnel that has not
    /// been handed out yet; a tunnel already in use is waited for.
    pub async fn handle_tunnel(
        &self,
        ctx: &CallContext,
        agent: &AgentInfo,
        stream: TunnelStream,
    ) -> Result<(), Status> {
        let TunnelStream {
            mut inbound,
            outbound,
        } = stream;

        let first = tokio::select! {
            _ = ctx.done() => return Ok(()),
            first = inbound.next() => first,
        };
        let frame = match first {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                if !request_cancelled(&e) {
                    debug!(agent_id = agent.id, error = %e, "Failed to read from incoming tunnel");
                }
                return Err(Status::unavailable("unavailable"));
            }
            None => return Err(Status::unavailable("unavailable")),
        };
        let kind = frame.kind();
        let Some(connect_request::Msg::Descriptor(descriptor)) = frame.msg else {
            return Err(Status::invalid_argument(format!(
                "Invalid oneof value type: {kind:?}"
            )));
        };
        descriptor.validate()?;
        let agent_descriptor = descriptor.agent_descriptor.unwrap_or_default();

        let info = TunnelInfo {
            agent_descriptor: Some(agent_descriptor.clone()),
            connection_id: connection_id(),
            agent_id: agent.id,
            broker_url: self.broker_url.to_string(),
        };
        let conn_id = info.connection_id;
        let (ret_tx, mut ret_rx) = oneshot::channel();
        let tunnel = Tunnel::new(info, agent_descriptor, inbound, outbound, ret_tx);

        tokio::select! {
            _ = ctx.done() => return Ok(()),
            sent = self.commands.send(RegistryCommand::Register(tunnel)) => {
                if sent.is_err() {
                    return Err(Status::unavailable("broker is shutting down"));
                }
            }
        }
        info!(agent_id = agent.id, connection_id = conn_id, "Tunnel registered");

        tokio::select! {
            ret = &mut ret_rx => return tunnel_result(ret),
            _ = ctx.done() => {}
        }

        // Whoever holds the tunnel now, the loop or a caller, settles it.
        let unregister = RegistryCommand::Unregister {
            agent_id: agent.id,
            connection_id: conn_id,
        };
        tokio::select! {
            ret = &mut ret_rx => return tunnel_result(ret),
            _ = self.commands.send(unregister) => {}
        }
        tunnel_result(ret_rx.await)
    }

    /// Wait for a tunnel to `agent_id`.
    ///
    /// The returned tunnel must be used with [`Tunnel::forward_stream`] or
    /// released with [`Tunnel::done`].
    pub async fn find_tunnel(
        &self,
        ctx: &CallContext,
        agent_id: i64,
    ) -> Result<Tunnel, RegistryError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, mut reply_rx) = oneshot::channel();
        let request = FindRequest {
            id: request_id,
            agent_id,
            reply: reply_tx,
        };

        tokio::select! {
            err = ctx.done() => return Err(err.into()),
            sent = self.commands.send(RegistryCommand::Find(request)) => {
                sent.map_err(|_| RegistryError::ShuttingDown)?;
            }
        }

        let err = tokio::select! {
            reply = &mut reply_rx => return reply.map_err(|_| RegistryError::ShuttingDown),
            err = ctx.done() => err,
        };

        let abort = RegistryCommand::FindAbort {
            agent_id,
            request_id,
        };
        tokio::select! {
            reply = &mut reply_rx => {
                if let Ok(tunnel) = reply {
                    release_late(tunnel);
                }
                return Err(err.into());
            }
            _ = self.commands.send(abort) => {}
        }
        // A reply may already be on its way; closing the slot makes any
        // later hand-off fail so the loop keeps the tunnel.
        reply_rx.close();
        if let Ok(tunnel) = reply_rx.try_recv() {
            release_late(tunnel);
        }
        debug!(agent_id, request_id, error = %err, "Gave up waiting for a tunnel");
        Err(err.into())
    }

    /// Current registry counters.
    pub async fn stats(&self) -> Result<RegistryStats, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(RegistryCommand::Stats(tx))
            .await
            .map_err(|_| RegistryError::ShuttingDown)?;
        rx.await.map_err(|_| RegistryError::ShuttingDown)
    }
}

fn tunnel_result(
    ret: Result<Result<(), Status>, oneshot::error::RecvError>,
) -> Result<(), Status> {
    ret.unwrap_or_else(|_| Err(Status::cancelled("tunnel dropped")))
}

/// A tunnel that arrived after its finder gave up cannot be put back, so it
/// is released and the agent reconnects.
fn release_late(mut tunnel: Tunnel) {
    debug!(
        agent_id = tunnel.agent_id(),
        connection_id = tunnel.connection_id(),
        "Releasing tunnel that arrived too late"
    );
    tunnel.done();
}

impl RegistryLoop {
    /// Process commands until `ctx` is done, then abort every tunnel and
    /// find request still held.
    pub async fn run(mut self, ctx: CallContext) {
        info!("Tunnel registry started");
        loop {
            tokio::select! {
                _ = ctx.done() => break,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
            }
        }
        self.shutdown();
        info!("Tunnel registry stopped");
    }

    fn handle(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Register(tunnel) => self.register(tunnel),
            RegistryCommand::Unregister {
                agent_id,
                connection_id,
            } => self.unregister(agent_id, connection_id),
            RegistryCommand::Find(request) => self.find(request),
            RegistryCommand::FindAbort {
                agent_id,
                request_id,
            } => {
                self.remove_find(agent_id, request_id);
            }
            RegistryCommand::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn register(&mut self, mut tunnel: Tunnel) {
        let agent_id = tunnel.agent_id();
        // A waiting finder gets the tunnel straight away.
        while let Some(request) = self.take_find(agent_id) {
            match request.reply.send(tunnel) {
                Ok(()) => {
                    debug!(
                        agent_id,
                        request_id = request.id,
                        "Tunnel handed to waiting request"
                    );
                    return;
                }
                Err(returned) => tunnel = returned,
            }
        }

        self.tracker.register_tunnel(tunnel.info());
        let connection_id = tunnel.connection_id();
        self.by_agent
            .entry(agent_id)
            .or_default()
            .insert(connection_id);
        self.tunnels.insert(connection_id, tunnel);
    }

    fn unregister(&mut self, agent_id: i64, connection_id: i64) {
        // Gone already if it was handed out.
        if let Some(tunnel) = self.remove_tunnel(agent_id, connection_id) {
            tunnel.abort(Status::cancelled("context done"));
        }
    }

    fn find(&mut self, request: FindRequest) {
        let agent_id = request.agent_id;
        let candidate = self
            .by_agent
            .get(&agent_id)
            .and_then(|conns| conns.iter().next().copied());
        let Some(connection_id) = candidate else {
            let requests = self.finds.entry(agent_id).or_default();
            // Finders dropped without a FindAbort leave closed slots behind.
            requests.retain(|_, waiting| !waiting.reply.is_closed());
            requests.insert(request.id, request);
            return;
        };
        let Some(tunnel) = self.remove_tunnel(agent_id, connection_id) else {
            return;
        };
        if let Err(tunnel) = request.reply.send(tunnel) {
            // The finder gave up before the command was processed.
            warn!(
                agent_id,
                request_id = request.id,
                "Find request closed before hand-off"
            );
            self.register(tunnel);
        }
    }

    /// Take any waiting find request for `agent_id`.
    fn take_find(&mut self, agent_id: i64) -> Option<FindRequest> {
        let request_id = *self.finds.get(&agent_id)?.keys().next()?;
        self.remove_find(agent_id, request_id)
    }

    fn remove_find(&mut self, agent_id: i64, request_id: u64) -> Option<FindRequest> {
        let requests = self.finds.get_mut(&agent_id)?;
        let request = requests.remove(&request_id);
        if requests.is_empty() {
            self.finds.remove(&agent_id);
        }
        request
    }

    fn remove_tunnel(&mut self, agent_id: i64, connection_id: i64) -> Option<Tunnel> {
        let tunnel = self.tunnels.remove(&connection_id)?;
        if let Some(conns) = self.by_agent.get_mut(&agent_id) {
            conns.remove(&connection_id);
            if conns.is_empty() {
                self.by_agent.remove(&agent_id);
            }
        }
        self.tracker.unregister_tunnel(tunnel.info());
        Some(tunnel)
    }

    fn stats(&self) -> RegistryStats {
        RegistryStats {
            tunnels: self.tunnels.len(),
            agents: self.by_agent.len(),
            pending_finds: self.finds.values().map(HashMap::len).sum(),
        }
    }

    fn shutdown(&mut self) {
        let stats = self.stats();
        for (_, tunnel) in self.tunnels.drain() {
            self.tracker.unregister_tunnel(tunnel.info());
            tunnel.abort(Status::cancelled("context done"));
        }
        self.by_agent.clear();
        // Dropping the reply slots tells finders there is no tunnel.
        self.finds.clear();

        // Anything still queued is answered the same way; senders blocked on
        // a full queue are woken by the close.
        self.commands.close();
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                RegistryCommand::Register(tunnel) => {
                    tunnel.abort(Status::cancelled("context done"));
                }
                RegistryCommand::Find(_)
                | RegistryCommand::FindAbort { .. }
                | RegistryCommand::Unregister { .. }
                | RegistryCommand::Stats(_) => {}
            }
        }
        debug!(
            tunnels = stats.tunnels,
            pending_finds = stats.pending_finds,
            "Tunnel registry cleaned up"
        );
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
#[path = "tunnel_registry_tests.rs"]
mod tests;
