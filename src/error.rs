//! Error types for stratabd
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using StrataError
pub type Result<T> = std::result::Result<T, StrataError>;

/// Unified error type for stratabd operations
#[derive(Debug, Error)]
pub enum StrataError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Argument Errors
    // -------------------------------------------------------------------------
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // -------------------------------------------------------------------------
    // Layer File Errors
    // -------------------------------------------------------------------------
    #[error("corrupt layer file: {0}")]
    Corrupt(String),

    #[error("invalid state: {0}")]
    State(String),

    // -------------------------------------------------------------------------
    // Cache Pool Errors
    // -------------------------------------------------------------------------
    #[error("not found: {0}")]
    NotFound(String),

    #[error("cache pool over risk mark after eviction: used {used}, risk mark {risk_mark}")]
    ResourceFull { used: u64, risk_mark: u64 },

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl StrataError {
    /// Shorthand for an InvalidArgument error
    pub fn invalid(msg: impl Into<String>) -> Self {
        StrataError::InvalidArgument(msg.into())
    }

    /// Shorthand for a Corrupt error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        StrataError::Corrupt(msg.into())
    }

    /// Shorthand for a State error
    pub fn state(msg: impl Into<String>) -> Self {
        StrataError::State(msg.into())
    }
}
