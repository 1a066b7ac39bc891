//! Grammar-checked dispatch of oneof-shaped stream messages.
//!
//! Every message of a visited stream carries exactly one member of a oneof
//! group. The visitor tracks the kind of the last message read, rejects
//! frames (and end of stream) that the grammar does not allow after it, and
//! hands each accepted frame to the callback registered for its kind.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;
use std::pin::Pin;

use tokio_stream::{Stream, StreamExt};
use tonic::Status;
use tracing::trace;

use crate::transitions::{GrammarError, State, Transitions};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A message made of a single oneof group.
pub trait OneofFrame: Sized + Send + 'static {
    type Kind: Copy + Eq + Hash + Ord + fmt::Debug + Send + Sync + 'static;

    /// Fully qualified name of the oneof group, used in error messages.
    const NAME: &'static str;

    /// Every member of the oneof group.
    const KINDS: &'static [Self::Kind];

    /// The member that is set, `None` when the group is empty.
    fn kind(&self) -> Option<Self::Kind>;

    /// The order in which members may appear on a stream.
    fn transitions() -> Transitions<Self::Kind>;
}

/// The payload of one member of the oneof group of `M`.
pub trait FramePayload<M: OneofFrame>: Sized {
    const KIND: M::Kind;

    fn from_frame(frame: M) -> Option<Self>;
}

/// A frame kind (or end of stream) arrived where the grammar does not allow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition<K> {
    pub from: State<K>,
    pub to: State<K>,
    pub allowed: Vec<State<K>>,
}

impl<K: fmt::Debug> fmt::Display for InvalidTransition<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "transition from {} to {} is not allowed. Allowed: [",
            self.from, self.to
        )?;
        for (i, state) in self.allowed.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{state}")?;
        }
        f.write_str("]")
    }
}

type FrameCallback<'a, M> = Box<dyn FnMut(M) -> BoxFuture<'a, Result<(), Status>> + Send + 'a>;
type EofCallback<'a> = Box<dyn FnOnce() -> BoxFuture<'a, Result<(), Status>> + Send + 'a>;
type InvalidTransitionCallback<'a, M> = Box<
    dyn FnMut(&InvalidTransition<<M as OneofFrame>::Kind>, Option<&M>) -> Status + Send + 'a,
>;

/// Callbacks for a single [`StreamVisitor::visit`] call.
///
/// Every kind of the oneof group needs exactly one callback. Registration
/// problems are reported by `visit` before the stream is read.
pub struct Callbacks<'a, M: OneofFrame> {
    start: State<M::Kind>,
    frames: HashMap<M::Kind, FrameCallback<'a, M>>,
    duplicates: Vec<M::Kind>,
    eof: Option<EofCallback<'a>>,
    invalid_transition: Option<InvalidTransitionCallback<'a, M>>,
}

impl<M: OneofFrame> Default for Callbacks<'_, M> {
    fn default() -> Self {
        Self {
            start: State::Start,
            frames: HashMap::new(),
            duplicates: Vec::new(),
            eof: None,
            invalid_transition: None,
        }
    }
}

impl<'a, M: OneofFrame> Callbacks<'a, M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Visit as if a frame of `kind` has just been read. Used when the first
    /// frame of a stream was consumed before the visitor took over.
    #[must_use]
    pub fn start_after(mut self, kind: M::Kind) -> Self {
        self.start = State::Kind(kind);
        self
    }

    /// Register a callback for the member `P`, receiving the unwrapped payload.
    #[must_use]
    pub fn on<P, F, Fut>(self, mut cb: F) -> Self
    where
        P: FramePayload<M> + 'a,
        F: FnMut(P) -> Fut + Send + 'a,
        Fut: Future<Output = Result<(), Status>> + Send + 'a,
    {
        self.register(
            P::KIND,
            Box::new(move |frame: M| -> BoxFuture<'a, Result<(), Status>> {
                match P::from_frame(frame) {
                    Some(payload) => Box::pin(cb(payload)),
                    None => Box::pin(std::future::ready(Err(Status::internal(format!(
                        "frame does not carry {}.{:?}",
                        M::NAME,
                        P::KIND
                    ))))),
                }
            }),
        )
    }

    /// Register a callback for `kind`, receiving the whole message.
    #[must_use]
    pub fn on_frame<F, Fut>(self, kind: M::Kind, mut cb: F) -> Self
    where
        F: FnMut(M) -> Fut + Send + 'a,
        Fut: Future<Output = Result<(), Status>> + Send + 'a,
    {
        self.register(
            kind,
            Box::new(move |frame: M| -> BoxFuture<'a, Result<(), Status>> { Box::pin(cb(frame)) }),
        )
    }

    /// Called once when the stream ends where the grammar allows it to.
    /// Without one, such an end is simply success.
    #[must_use]
    pub fn on_eof<F, Fut>(mut self, cb: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<(), Status>> + Send + 'a,
    {
        self.eof = Some(Box::new(move || -> BoxFuture<'a, Result<(), Status>> {
            Box::pin(cb())
        }));
        self
    }

    /// Replace the default `InvalidArgument` produced for a rejected frame.
    /// The message is `None` when the rejected transition is end of stream.
    #[must_use]
    pub fn on_invalid_transition<F>(mut self, cb: F) -> Self
    where
        F: FnMut(&InvalidTransition<M::Kind>, Option<&M>) -> Status + Send + 'a,
    {
        self.invalid_transition = Some(Box::new(cb));
        self
    }

    fn register(mut self, kind: M::Kind, callback: FrameCallback<'a, M>) -> Self {
        if self.frames.insert(kind, callback).is_some() {
            self.duplicates.push(kind);
        }
        self
    }
}

/// Consumes streams of `M` following its grammar. Build once, visit many.
pub struct StreamVisitor<M: OneofFrame> {
    graph: HashMap<State<M::Kind>, Vec<State<M::Kind>>>,
    _frame: PhantomData<fn() -> M>,
}

impl<M: OneofFrame> Clone for StreamVisitor<M> {
    fn clone(&self) -> Self {
        Self {
            graph: self.graph.clone(),
            _frame: PhantomData,
        }
    }
}

impl<M: OneofFrame> StreamVisitor<M> {
    /// Build a visitor from the grammar `M` declares.
    pub fn new() -> Result<Self, GrammarError> {
        Self::with_transitions(M::transitions())
    }

    pub fn with_transitions(transitions: Transitions<M::Kind>) -> Result<Self, GrammarError> {
        Ok(Self {
            graph: transitions.compile(M::NAME, M::KINDS)?,
            _frame: PhantomData,
        })
    }

    /// States the grammar allows right after `state`.
    pub fn allowed(&self, state: State<M::Kind>) -> &[State<M::Kind>] {
        self.graph.get(&state).map_or(&[], Vec::as_slice)
    }

    /// Read `stream` to its end (or the first failure), dispatching every frame.
    ///
    /// Errors from the stream and from callbacks are returned unchanged. The
    /// callback of a frame the grammar rejects is never invoked.
    pub async fn visit<S>(&self, stream: &mut S, callbacks: Callbacks<'_, M>) -> Result<(), Status>
    where
        S: Stream<Item = Result<M, Status>> + Unpin + Send,
    {
        let Callbacks {
            start,
            mut frames,
            duplicates,
            eof,
            mut invalid_transition,
        } = callbacks;

        if let Some(kind) = duplicates.first() {
            return Err(Status::internal(format!(
                "callback for {}.{kind:?} has already been defined",
                M::NAME
            )));
        }
        if let Some(kind) = M::KINDS.iter().find(|k| !frames.contains_key(*k)) {
            return Err(Status::internal(format!(
                "no callback defined for {}.{kind:?}",
                M::NAME
            )));
        }

        let mut current = start;
        loop {
            let allowed = self.allowed(current);
            let Some(item) = stream.next().await else {
                if allowed.contains(&State::Eof) {
                    return match eof {
                        Some(cb) => cb().await,
                        None => Ok(()),
                    };
                }
                let invalid = InvalidTransition {
                    from: current,
                    to: State::Eof,
                    allowed: allowed.to_vec(),
                };
                return Err(reject(invalid_transition.as_mut(), &invalid, None));
            };
            let frame = item?;
            let Some(kind) = frame.kind() else {
                return Err(Status::invalid_argument(format!(
                    "no fields in the oneof group {} are set",
                    M::NAME
                )));
            };
            let next = State::Kind(kind);
            if !allowed.contains(&next) {
                let invalid = InvalidTransition {
                    from: current,
                    to: next,
                    allowed: allowed.to_vec(),
                };
                return Err(reject(invalid_transition.as_mut(), &invalid, Some(&frame)));
            }
            trace!(oneof = M::NAME, from = %current, to = %next, "frame accepted");
            if let Some(cb) = frames.get_mut(&kind) {
                cb(frame).await?;
            }
            current = next;
        }
    }
}

fn reject<M: OneofFrame>(
    handler: Option<&mut InvalidTransitionCallback<'_, M>>,
    invalid: &InvalidTransition<M::Kind>,
    frame: Option<&M>,
) -> Status {
    match handler {
        Some(cb) => cb(invalid, frame),
        None => Status::invalid_argument(invalid.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
#[path = "stream_visitor_tests.rs"]
mod tests;
