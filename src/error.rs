//! Error types for EmberKV
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using EmberError
pub type Result<T> = std::result::Result<T, EmberError>;

/// Unified error type for EmberKV operations
#[derive(Debug, Error)]
pub enum EmberError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Snapshot Errors
    // -------------------------------------------------------------------------
    #[error("Path escapes base directory: {0}")]
    PathEscape(String),

    #[error("Another save is already in progress")]
    Busy,

    #[error("Snapshot codec error: {0}")]
    Codec(String),

    #[error("No snapshot file matches pattern: {0}")]
    MainFileMissing(String),

    #[error("Multiple snapshot files match pattern {pattern}: {candidates:?}")]
    MainFileAmbiguous {
        pattern: String,
        candidates: Vec<String>,
    },

    #[error("Dataset is loading")]
    Loading,

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    // -------------------------------------------------------------------------
    // Keyspace Errors
    // -------------------------------------------------------------------------
    #[error("Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("Database index out of range: {0}")]
    InvalidDb(usize),

    // -------------------------------------------------------------------------
    // Scheduling Errors
    // -------------------------------------------------------------------------
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    // -------------------------------------------------------------------------
    // Protocol Errors
    // -------------------------------------------------------------------------
    #[error("Protocol error: {0}")]
    Protocol(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl EmberError {
    /// Build a codec error from any displayable cause
    pub(crate) fn codec(context: &str, cause: impl std::fmt::Display) -> Self {
        EmberError::Codec(format!("{}: {}", context, cause))
    }
}
