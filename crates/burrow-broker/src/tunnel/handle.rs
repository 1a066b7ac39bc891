//! A registered tunnel and the forwarding of one call through it.

use std::fmt;
use std::sync::{Arc, LazyLock, OnceLock};

use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_util::task::AbortOnDropHandle;
use tonic::Status;
use tracing::debug;

use burrow_core::CallContext;
use burrow_grpctool::{Callbacks, GrammarError, InvalidTransition, State, StreamVisitor};
use burrow_proto::v1::{
    AgentDescriptor, ConnectRequest, ConnectRequestKind, ConnectResponse, Descriptor, Error,
    Header, Message, Trailer, TunnelInfo, Validate, meta_to_values_map,
};

use super::{IncomingStream, TunnelDataCallback, TunnelInbound, TunnelOutbound};

static TUNNEL_VISITOR: LazyLock<Result<StreamVisitor<ConnectRequest>, GrammarError>> =
    LazyLock::new(StreamVisitor::new);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Ready,
    Forwarding,
    Done,
}

/// A registered agent tunnel, usable for one call.
///
/// Whoever obtains a tunnel from the registry must either forward a call
/// through it or release it with [`Tunnel::done`]. Either way the agent's
/// `Connect` handler is unblocked with the outcome and the tunnel lets go of
/// the agent's response stream.
pub struct Tunnel {
    info: TunnelInfo,
    descriptor: AgentDescriptor,
    inbound: Option<TunnelInbound>,
    outbound: Option<TunnelOutbound>,
    ret_tx: Option<oneshot::Sender<Result<(), Status>>>,
    state: TunnelState,
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("agent_id", &self.info.agent_id)
            .field("connection_id", &self.info.connection_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Outcome of one forwarding worker: what the agent's tunnel handler should
/// return, and what the inbound call should return.
#[derive(Debug, Default)]
struct ErrPair {
    for_tunnel: Option<Status>,
    for_incoming: Option<Status>,
}

impl ErrPair {
    fn both(status: Status) -> Self {
        Self {
            for_tunnel: Some(status.clone()),
            for_incoming: Some(status),
        }
    }

    const fn is_ok(&self) -> bool {
        self.for_tunnel.is_none() && self.for_incoming.is_none()
    }
}

impl Tunnel {
    pub(crate) fn new(
        info: TunnelInfo,
        descriptor: AgentDescriptor,
        inbound: TunnelInbound,
        outbound: TunnelOutbound,
        ret_tx: oneshot::Sender<Result<(), Status>>,
    ) -> Self {
        Self {
            info,
            descriptor,
            inbound: Some(inbound),
            outbound: Some(outbound),
            ret_tx: Some(ret_tx),
            state: TunnelState::Ready,
        }
    }

    pub fn agent_id(&self) -> i64 {
        self.info.agent_id
    }

    pub fn connection_id(&self) -> i64 {
        self.info.connection_id
    }

    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    pub fn info(&self) -> &TunnelInfo {
        &self.info
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Forward `incoming` through the tunnel in both directions.
    ///
    /// What the agent sends back is handed to `cb`. Returns the status for
    /// the inbound call; the agent's handler receives its own status. Only
    /// valid once, on a tunnel that is still `Ready`.
    ///
    /// Dropping the returned future stops both directions; the agent's
    /// handler then ends as if the tunnel was dropped.
    pub async fn forward_stream(
        &mut self,
        incoming: IncomingStream,
        cb: Arc<dyn TunnelDataCallback>,
    ) -> Result<(), Status> {
        if self.state != TunnelState::Ready {
            return Err(Status::internal(format!("Invalid state {:?}", self.state)));
        }
        let visitor = TUNNEL_VISITOR
            .as_ref()
            .map_err(|e| Status::internal(e.to_string()))?;
        let (Some(inbound), Some(outbound), Some(ret_tx)) =
            (self.inbound.take(), self.outbound.take(), self.ret_tx.take())
        else {
            return Err(Status::internal("Tunnel streams are gone"));
        };
        self.state = TunnelState::Forwarding;
        debug!(
            agent_id = self.info.agent_id,
            connection_id = self.info.connection_id,
            method = %incoming.method,
            "Forwarding call through tunnel"
        );

        // The agent must see the request info before anything is read from
        // the tunnel, so the tunnel side waits for this gate.
        let (gate_tx, gate_rx) = oneshot::channel();
        // One slot: the loser blocks on its send until it is aborted.
        let (result_tx, mut result_rx) = mpsc::channel(1);
        let incoming_ctx = incoming.ctx.clone();
        let workers = [
            AbortOnDropHandle::new(tokio::spawn(report(
                result_tx.clone(),
                pipe_incoming(incoming, outbound, gate_tx),
            ))),
            AbortOnDropHandle::new(tokio::spawn(report(
                result_tx,
                pipe_tunnel(visitor, inbound, cb, gate_rx, incoming_ctx),
            ))),
        ];

        let mut received = 0;
        let mut pair = ErrPair::default();
        while received < workers.len() {
            let Some(next) = result_rx.recv().await else {
                pair = ErrPair::both(Status::internal("forwarding worker failed"));
                break;
            };
            received += 1;
            pair = next;
            if !pair.is_ok() {
                break;
            }
        }
        drop(workers);

        debug!(
            connection_id = self.info.connection_id,
            tunnel_error = ?pair.for_tunnel,
            incoming_error = ?pair.for_incoming,
            "Forwarding finished"
        );
        let _ = ret_tx.send(pair.for_tunnel.map_or(Ok(()), Err));
        pair.for_incoming.map_or(Ok(()), Err)
    }

    /// Release the tunnel. Unblocks the agent's handler when the tunnel was
    /// never used; a no-op after forwarding.
    ///
    /// # Panics
    ///
    /// When called more than once.
    #[allow(clippy::panic)]
    pub fn done(&mut self) {
        match self.state {
            TunnelState::Ready => {
                self.state = TunnelState::Done;
                self.outbound = None;
                if let Some(ret_tx) = self.ret_tx.take() {
                    let _ = ret_tx.send(Ok(()));
                }
            }
            TunnelState::Forwarding => {}
            TunnelState::Done => panic!("Tunnel::done() called more than once"),
        }
    }

    /// End an unused tunnel with `status` for the agent's handler.
    pub(crate) fn abort(mut self, status: Status) {
        self.state = TunnelState::Done;
        if let Some(ret_tx) = self.ret_tx.take() {
            let _ = ret_tx.send(Err(status));
        }
    }
}

fn unavailable() -> Status {
    Status::unavailable("unavailable")
}

fn tunnel_closed() -> Status {
    Status::unavailable("tunnel closed")
}

async fn report(results: mpsc::Sender<ErrPair>, worker: impl Future<Output = ErrPair>) {
    let _ = results.send(worker.await).await;
}

/// Inbound call -> tunnel.
async fn pipe_incoming(
    incoming: IncomingStream,
    outbound: TunnelOutbound,
    gate: oneshot::Sender<()>,
) -> ErrPair {
    let IncomingStream {
        method,
        metadata,
        mut frames,
        ctx,
    } = incoming;

    let request_info = ConnectResponse::request_info(method, meta_to_values_map(&metadata));
    if outbound.send(Ok(request_info)).await.is_err() {
        return ErrPair::both(tunnel_closed());
    }
    let _ = gate.send(());

    loop {
        let item = tokio::select! {
            item = frames.next() => item,
            err = ctx.done() => {
                return ErrPair {
                    for_tunnel: Some(unavailable()),
                    for_incoming: Some(err.into()),
                };
            }
        };
        match item {
            Some(Ok(data)) => {
                if outbound.send(Ok(ConnectResponse::message(data))).await.is_err() {
                    return ErrPair::both(tunnel_closed());
                }
            }
            Some(Err(e)) => {
                return ErrPair {
                    for_tunnel: Some(unavailable()),
                    for_incoming: Some(e),
                };
            }
            None => break,
        }
    }

    if outbound.send(Ok(ConnectResponse::close_send())).await.is_err() {
        return ErrPair::both(tunnel_closed());
    }
    ErrPair::default()
}

/// Tunnel -> inbound call.
async fn pipe_tunnel(
    visitor: &'static StreamVisitor<ConnectRequest>,
    mut inbound: TunnelInbound,
    cb: Arc<dyn TunnelDataCallback>,
    gate: oneshot::Receiver<()>,
    ctx: CallContext,
) -> ErrPair {
    tokio::select! {
        _ = ctx.done() => {
            return ErrPair {
                for_tunnel: None,
                for_incoming: Some(unavailable()),
            };
        }
        started = gate => {
            // The other side failed before the request info went out and
            // carries the error.
            if started.is_err() {
                return ErrPair::default();
            }
        }
    }

    // Each side's error is decided at most once: both the Error frame and a
    // rejected Descriptor end the visit.
    let for_tunnel = OnceLock::new();
    let for_incoming = OnceLock::new();
    let tunnel_slot = &for_tunnel;
    let incoming_slot = &for_incoming;
    let cb = &*cb;

    let callbacks = Callbacks::<ConnectRequest>::new()
        .start_after(ConnectRequestKind::Descriptor)
        .on(move |_: Descriptor| std::future::ready(Err(unexpected_descriptor(tunnel_slot))))
        .on(move |header: Header| async move { cb.header(header.metadata()).await })
        .on(move |message: Message| async move { cb.message(message.data).await })
        .on(move |trailer: Trailer| async move {
            cb.trailer(trailer.metadata()).await;
            Ok(())
        })
        .on(move |error: Error| {
            // Keep reading: the agent closes the stream right after the
            // error and the stream must be drained to its end.
            let result = match (error.validate(), error.status) {
                (Ok(()), Some(status)) => {
                    let _ = incoming_slot.set(status.to_status());
                    Ok(())
                }
                (Err(invalid), _) => {
                    let _ = tunnel_slot.set(invalid.into());
                    Err(Status::internal("Invalid Error message received"))
                }
                (Ok(()), None) => Err(Status::internal("Invalid Error message received")),
            };
            std::future::ready(result)
        })
        .on_invalid_transition(
            move |invalid: &InvalidTransition<ConnectRequestKind>, _: Option<&ConnectRequest>| {
                if invalid.to == State::Kind(ConnectRequestKind::Descriptor) {
                    return unexpected_descriptor(tunnel_slot);
                }
                Status::invalid_argument(invalid.to_string())
            },
        );

    let result = visitor.visit(&mut inbound, callbacks).await;

    let mut pair = ErrPair {
        for_tunnel: for_tunnel.into_inner(),
        for_incoming: for_incoming.into_inner(),
    };
    if let Err(err) = result {
        pair.for_incoming = Some(err);
        pair.for_tunnel.get_or_insert_with(unavailable);
    }
    pair
}

/// The descriptor was consumed at registration and must not be sent again.
fn unexpected_descriptor(tunnel_slot: &OnceLock<Status>) -> Status {
    let _ = tunnel_slot.set(Status::invalid_argument(
        "Unexpected Descriptor message received",
    ));
    Status::internal("Unexpected Descriptor message received")
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
#[path = "handle_tests.rs"]
mod tests;
