//! Overseer security core
//!
//! This crate decides whether the Overseer desktop assistant may run a command, touch a
//! file or reach a URL, and keeps the audit trail and undo history for what it allowed.
//! The process runner itself lives elsewhere; callers ask [`SecurityManager`] first and
//! honour the outcome it returns.

pub mod error;
pub mod security;
pub mod utils;

pub use error::{OverseerError, Result};
pub use security::{OperationContext, SecurityConfig, SecurityManager, SecurityPaths};
pub use utils::*;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
