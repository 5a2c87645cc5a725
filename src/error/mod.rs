//! Error handling module for the Overseer security core
//!
//! This module provides the error type shared by every security component.

mod error;

// Re-export the main error types and utilities
pub use error::{OverseerError, Result};
