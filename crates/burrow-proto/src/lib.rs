//! Burrow Protocol Buffers
//!
//! prost messages for the reverse tunnel wire protocol.
//!
//! This crate contains:
//! - `ConnectRequest`/`ConnectResponse`, the two directions of an agent tunnel,
//!   together with the frame order each direction must follow
//! - `AgentDescriptor`, the services and methods an agent can serve
//! - `TunnelInfo`, the record published to the presence tracker
//! - metadata <-> values-map conversion and message validation

#![allow(clippy::derive_partial_eq_without_eq)]

pub mod error;

/// Burrow v1 API definitions.
pub mod v1;

pub use error::ValidationError;
// Re-export v1 as the default API version for convenience
pub use v1::*;

// Re-export prost_types for downstream crates that build `Any` details
pub use prost_types;
