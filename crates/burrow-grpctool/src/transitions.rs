//! Declarative frame-order grammars.
//!
//! A grammar names, for every kind of a oneof group, the kinds that may
//! legally follow it (and whether the stream may end after it), plus the kinds
//! that may open the stream. Grammars are validated once, when a
//! [`StreamVisitor`](crate::StreamVisitor) is built, so a broken protocol
//! definition never reaches the first message.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

/// A node of the transition graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum State<K> {
    /// Nothing has been read yet.
    Start,
    /// A frame of this kind was the last one read.
    Kind(K),
    /// The stream ended.
    Eof,
}

impl<K: fmt::Debug> fmt::Display for State<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::Kind(kind) => write!(f, "{kind:?}"),
            Self::Eof => f.write_str("EOF"),
        }
    }
}

/// Errors in a grammar definition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GrammarError {
    #[error("{oneof}.{kind} does not have any transitions defined")]
    MissingTransitions { oneof: &'static str, kind: String },

    #[error("empty allowed transition list for {from} in oneof {oneof}")]
    EmptyTransitions { oneof: &'static str, from: String },

    #[error("{kind} is not part of oneof {oneof}")]
    UnknownKind { oneof: &'static str, kind: String },

    #[error("unreachable fields in oneof {oneof}: [{}]", kinds.join(", "))]
    Unreachable {
        oneof: &'static str,
        kinds: Vec<String>,
    },
}

/// Builder for a grammar over frame kinds `K`.
#[derive(Debug, Clone)]
pub struct Transitions<K> {
    first: Vec<K>,
    next: HashMap<K, Vec<State<K>>>,
}

impl<K> Default for Transitions<K> {
    fn default() -> Self {
        Self {
            first: Vec::new(),
            next: HashMap::new(),
        }
    }
}

impl<K: Copy + Eq + Hash + Ord + fmt::Debug> Transitions<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kinds that may open the stream.
    #[must_use]
    pub fn first(mut self, kinds: impl IntoIterator<Item = K>) -> Self {
        self.first.extend(kinds);
        self
    }

    /// Kinds that may follow `from`.
    #[must_use]
    pub fn next(mut self, from: K, kinds: impl IntoIterator<Item = K>) -> Self {
        self.next
            .entry(from)
            .or_default()
            .extend(kinds.into_iter().map(State::Kind));
        self
    }

    /// The stream may end right after `from`.
    #[must_use]
    pub fn end(mut self, from: K) -> Self {
        self.next.entry(from).or_default().push(State::Eof);
        self
    }

    /// Validate the grammar against the complete list of kinds of the oneof
    /// group and flatten it into an adjacency map keyed by [`State`].
    pub(crate) fn compile(
        self,
        oneof: &'static str,
        kinds: &[K],
    ) -> Result<HashMap<State<K>, Vec<State<K>>>, GrammarError> {
        let known: HashSet<K> = kinds.iter().copied().collect();
        let mut graph = HashMap::with_capacity(kinds.len() + 1);

        for kind in kinds {
            let Some(successors) = self.next.get(kind) else {
                return Err(GrammarError::MissingTransitions {
                    oneof,
                    kind: format!("{kind:?}"),
                });
            };
            graph.insert(State::Kind(*kind), successors.clone());
        }
        let mut declared: Vec<&K> = self.next.keys().collect();
        declared.sort();
        if let Some(stray) = declared.into_iter().find(|k| !known.contains(k)) {
            return Err(GrammarError::UnknownKind {
                oneof,
                kind: format!("{stray:?}"),
            });
        }
        graph.insert(
            State::Start,
            self.first.iter().copied().map(State::Kind).collect(),
        );

        let mut origins: Vec<&State<K>> = graph.keys().collect();
        origins.sort();
        for from in origins {
            let successors = &graph[from];
            if successors.is_empty() {
                return Err(GrammarError::EmptyTransitions {
                    oneof,
                    from: from.to_string(),
                });
            }
            if let Some(State::Kind(stray)) = successors
                .iter()
                .find(|s| matches!(s, State::Kind(k) if !known.contains(k)))
            {
                return Err(GrammarError::UnknownKind {
                    oneof,
                    kind: format!("{stray:?}"),
                });
            }
        }

        let unreachable = unreachable_kinds(&graph, kinds);
        if !unreachable.is_empty() {
            return Err(GrammarError::Unreachable {
                oneof,
                kinds: unreachable.iter().map(|k| format!("{k:?}")).collect(),
            });
        }
        Ok(graph)
    }
}

/// Kinds not reachable from [`State::Start`], sorted.
fn unreachable_kinds<K: Copy + Eq + Hash + Ord>(
    graph: &HashMap<State<K>, Vec<State<K>>>,
    kinds: &[K],
) -> Vec<K> {
    let mut remaining: HashSet<K> = kinds.iter().copied().collect();
    let mut stack = vec![State::Start];
    while let Some(node) = stack.pop() {
        for child in graph.get(&node).into_iter().flatten() {
            if let State::Kind(kind) = child {
                if remaining.remove(kind) {
                    stack.push(*child);
                }
            }
        }
    }
    let mut result: Vec<K> = remaining.into_iter().collect();
    result.sort();
    result
}
