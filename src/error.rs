//! Error types for EpochKV
//!
//! Provides a unified error type for all operations. Every per-request
//! failure travels through the request's own completion handle; nothing in
//! this enum is fatal to a worker.

use thiserror::Error;

/// Result type alias using EpochError
pub type Result<T> = std::result::Result<T, EpochError>;

/// Unified error type for EpochKV operations
#[derive(Debug, Error)]
pub enum EpochError {
    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Connection is already closed")]
    AlreadyClosed,

    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Engine Errors
    // -------------------------------------------------------------------------
    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Execution Errors
    // -------------------------------------------------------------------------
    #[error("Operation panicked: {0}")]
    Panicked(String),

    #[error("Operation was dropped before it completed")]
    Abandoned,

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for EpochError {
    fn from(err: bincode::Error) -> Self {
        EpochError::Serialization(err.to_string())
    }
}

impl EpochError {
    /// Build a `Panicked` error from a caught panic payload
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        EpochError::Panicked(message)
    }
}
