//! Error types and handling for the Overseer security core

use thiserror::Error;

/// Result type alias for Overseer operations
pub type Result<T> = std::result::Result<T, OverseerError>;

/// Main error type for the Overseer security core
///
/// Policy decisions (rejections, denials, threat vetoes) are never reported through this
/// type; they are values returned by the facade. This enum covers storage and
/// programming failures at component boundaries.
#[derive(Error, Debug)]
pub enum OverseerError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Permission and user management errors
    #[error("Permission error: {message}")]
    Permission { message: String },

    /// Session errors
    #[error("Session error: {message}")]
    Session { message: String },

    /// Undo history and backup errors
    #[error("Undo error: {message}")]
    Undo { message: String },

    /// Encryption errors
    #[error("Encryption error: {message}")]
    Encryption { message: String },

    /// Audit log errors
    #[error("Audit error: {message}")]
    Audit { message: String },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Pattern compilation errors
    #[error("Pattern error: {0}")]
    Regex(#[from] regex::Error),

    /// Generic errors
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OverseerError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a permission error
    pub fn permission<S: Into<String>>(message: S) -> Self {
        Self::Permission {
            message: message.into(),
        }
    }

    /// Create a session error
    pub fn session<S: Into<String>>(message: S) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    /// Create an undo error
    pub fn undo<S: Into<String>>(message: S) -> Self {
        Self::Undo {
            message: message.into(),
        }
    }

    /// Create an encryption error
    pub fn encryption<S: Into<String>>(message: S) -> Self {
        Self::Encryption {
            message: message.into(),
        }
    }

    /// Create an audit error
    pub fn audit<S: Into<String>>(message: S) -> Self {
        Self::Audit {
            message: message.into(),
        }
    }

    /// Whether the error came from the filesystem or (de)serialization layer
    pub fn is_storage_error(&self) -> bool {
        matches!(self, OverseerError::Io(_) | OverseerError::Serde(_))
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            OverseerError::Config { .. } => "config",
            OverseerError::Validation { .. } => "validation",
            OverseerError::Permission { .. } => "permission",
            OverseerError::Session { .. } => "session",
            OverseerError::Undo { .. } => "undo",
            OverseerError::Encryption { .. } => "encryption",
            OverseerError::Audit { .. } => "audit",
            OverseerError::Io(_) => "io",
            OverseerError::Serde(_) => "serialization",
            OverseerError::Regex(_) => "pattern",
            OverseerError::Internal(_) => "internal",
        }
    }
}
