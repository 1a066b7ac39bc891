//! `burrow` Core Library
//!
//! Shared functionality for `burrow` components:
//! - Configuration resolution and hierarchy
//! - Tracing initialisation
//! - Call contexts (cancellation + deadline) for blocking operations
//! - Connection id generation
//! - Common error types

pub mod config;
pub mod context;
pub mod error;
pub mod id;
pub mod tracing_init;

pub use config::Config;
pub use context::{CallContext, ContextError};
pub use error::{Error, Result};
