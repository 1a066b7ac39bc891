//! One reverse tunnel, reconnected for as long as the agent runs.
//!
//! Each attempt opens a `Connect` call, sends the agent's descriptor and
//! then waits for the broker to route a call through it. The broker's frames
//! (`RequestInfo`, `Message`*, `CloseSend`) are fed to a local call; the
//! local response goes back as `Header`, `Message`*, `Trailer` or as a
//! single `Error`, after which the agent closes its side of the tunnel.

use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::task::AbortOnDropHandle;
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};
use tracing::{debug, warn};

use burrow_core::CallContext;
use burrow_core::config::AgentConfig;
use burrow_grpctool::{
    Callbacks, GrammarError, InvalidTransition, State, StreamVisitor, request_cancelled,
};
use burrow_proto::v1::{
    AgentDescriptor, CloseSend, ConnectRequest, ConnectResponse, ConnectResponseKind, Message,
    RequestInfo, meta_to_values_map,
};

use crate::local::{LocalFrame, LocalServer, TunnelConnector};

static RESPONSE_VISITOR: LazyLock<Result<StreamVisitor<ConnectResponse>, GrammarError>> =
    LazyLock::new(StreamVisitor::new);

type TunnelSender = mpsc::Sender<ConnectRequest>;

/// A reverse tunnel to the broker, serving one proxied call per `Connect`.
pub struct Connection {
    descriptor: AgentDescriptor,
    connector: Arc<dyn TunnelConnector>,
    local: Arc<dyn LocalServer>,
    config: AgentConfig,
}

/// Per-attempt state shared by the frame callbacks.
#[derive(Default)]
struct CallState {
    /// Send side of the tunnel, until a call takes it over.
    tunnel: Option<TunnelSender>,
    started: Option<oneshot::Sender<()>>,
    /// Request messages into the local call; dropped on `CloseSend`.
    requests: Option<mpsc::Sender<Vec<u8>>>,
    response: Option<AbortOnDropHandle<Result<(), Status>>>,
    /// The broker ended the stream where the grammar does not allow it.
    ended_early: bool,
}

impl Connection {
    pub fn new(
        descriptor: AgentDescriptor,
        connector: Arc<dyn TunnelConnector>,
        local: Arc<dyn LocalServer>,
        config: AgentConfig,
    ) -> Self {
        Self {
            descriptor,
            connector,
            local,
            config,
        }
    }

    /// Keep a tunnel open until `ctx` is done.
    ///
    /// After a served call, or a tunnel the broker closed, the next attempt
    /// starts straight away. A failed attempt is followed by a jittered pause.
    pub async fn run(&self, ctx: CallContext) {
        while ctx.err().is_none() {
            self.attempt_loop(&ctx).await;
            tokio::select! {
                _ = ctx.done() => break,
                () = tokio::time::sleep(self.config.connect_retry_delay()) => {}
            }
        }
    }

    async fn attempt_loop(&self, ctx: &CallContext) {
        while ctx.err().is_none() {
            if let Err(status) = self.attempt(ctx).await {
                if request_cancelled(&status) {
                    debug!(error = %status, "Reverse tunnel attempt cancelled");
                } else {
                    warn!(error = %status, "Reverse tunnel attempt failed");
                }
                return;
            }
        }
    }

    /// Open one tunnel and serve at most one call through it.
    ///
    /// `ctx` interrupts the attempt only while it waits for a call. Once the
    /// broker has sent the request info the call runs to completion.
    pub(crate) async fn attempt(&self, ctx: &CallContext) -> Result<(), Status> {
        let visitor = RESPONSE_VISITOR
            .as_ref()
            .map_err(|e| Status::internal(e.to_string()))?;
        let buffer = self.config.frame_buffer.max(1);

        let (tunnel_tx, tunnel_rx) = mpsc::channel(buffer);
        let mut responses = tokio::select! {
            connected = self.connector.connect(ReceiverStream::new(tunnel_rx)) => connected?,
            err = ctx.done() => return Err(err.into()),
        };
        tunnel_tx
            .send(ConnectRequest::descriptor(self.descriptor.clone()))
            .await
            .map_err(|_| Status::unavailable("tunnel closed before the descriptor was sent"))?;

        let (started_tx, started_rx) = oneshot::channel();
        let call = Mutex::new(CallState {
            tunnel: Some(tunnel_tx),
            started: Some(started_tx),
            ..CallState::default()
        });
        let call = &call;
        let local = &self.local;

        let callbacks = Callbacks::<ConnectResponse>::new()
            .on(move |info: RequestInfo| {
                let mut state = lock(call);
                let result = match state.tunnel.take() {
                    Some(tunnel) => {
                        debug!(method = %info.method_name, "Proxying call to local server");
                        let (requests_tx, requests_rx) = mpsc::channel(buffer);
                        state.requests = Some(requests_tx);
                        state.response = Some(AbortOnDropHandle::new(tokio::spawn(
                            pipe_local_into_tunnel(Arc::clone(local), info, requests_rx, tunnel),
                        )));
                        if let Some(started) = state.started.take() {
                            let _ = started.send(());
                        }
                        Ok(())
                    }
                    None => Err(Status::internal("tunnel already carries a call")),
                };
                std::future::ready(result)
            })
            .on(move |message: Message| {
                let requests = lock(call).requests.clone();
                async move {
                    let Some(requests) = requests else {
                        return Ok(());
                    };
                    if requests.send(message.data).await.is_err() {
                        debug!("Local call stopped reading request messages");
                    }
                    Ok(())
                }
            })
            .on(move |_: CloseSend| {
                lock(call).requests = None;
                std::future::ready(Ok(()))
            })
            .on_invalid_transition(
                move |invalid: &InvalidTransition<ConnectResponseKind>,
                      _: Option<&ConnectResponse>| {
                    if invalid.to == State::Eof {
                        lock(call).ended_early = true;
                    }
                    Status::invalid_argument(invalid.to_string())
                },
            );

        let interrupted = async {
            tokio::select! {
                err = ctx.done() => err,
                _ = started_rx => std::future::pending().await,
            }
        };
        let visited = tokio::select! {
            visited = visitor.visit(&mut responses, callbacks) => visited,
            err = interrupted => return Err(err.into()),
        };

        let (requests, response, ended_early) = {
            let mut state = lock(call);
            (
                state.requests.take(),
                state.response.take(),
                state.ended_early,
            )
        };
        // The local call sees the end of its request stream.
        drop(requests);
        let started = response.is_some();
        let responded = match response {
            Some(response) => response.await.unwrap_or_else(|e| {
                Err(Status::internal(format!("local call task failed: {e}")))
            }),
            None => Ok(()),
        };

        let visited = match visited {
            // The broker closes the tunnel as soon as it has the response,
            // possibly before the call's CloseSend.
            Err(_) if ended_early => Ok(()),
            Err(status) if !started && status.code() == Code::Cancelled => {
                debug!(error = %status, "Broker closed idle tunnel");
                Ok(())
            }
            visited => visited,
        };
        visited.and(responded)
    }
}

fn lock(call: &Mutex<CallState>) -> MutexGuard<'_, CallState> {
    call.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Local call -> tunnel. Dropping `tunnel` at the end closes the agent's
/// side of the `Connect` stream.
async fn pipe_local_into_tunnel(
    local: Arc<dyn LocalServer>,
    info: RequestInfo,
    requests: mpsc::Receiver<Vec<u8>>,
    tunnel: TunnelSender,
) -> Result<(), Status> {
    let requests = Box::pin(ReceiverStream::new(requests));
    let response = match local.call(&info.method_name, info.metadata(), requests).await {
        Ok(response) => response,
        Err(status) => return send_error(&tunnel, &status).await,
    };
    send(
        &tunnel,
        ConnectRequest::header(meta_to_values_map(&response.header)),
        "header",
    )
    .await?;

    let mut frames = response.frames;
    let mut trailer = MetadataMap::new();
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(LocalFrame::Message(data)) => {
                send(&tunnel, ConnectRequest::message(data), "message").await?;
            }
            Ok(LocalFrame::Trailer(meta)) => {
                trailer = meta;
                break;
            }
            Err(status) => return send_error(&tunnel, &status).await,
        }
    }
    send(
        &tunnel,
        ConnectRequest::trailer(meta_to_values_map(&trailer)),
        "trailer",
    )
    .await
}

async fn send(tunnel: &TunnelSender, frame: ConnectRequest, what: &str) -> Result<(), Status> {
    tunnel
        .send(frame)
        .await
        .map_err(|_| Status::unavailable(format!("tunnel closed while sending {what}")))
}

/// Report a failed local call in place of its response.
async fn send_error(tunnel: &TunnelSender, status: &Status) -> Result<(), Status> {
    debug!(error = %status, "Local call failed");
    send(tunnel, ConnectRequest::error(status), "error").await
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
#[path = "connection_tests.rs"]
mod tests;
