//! Error types for AtlasKV Native
//!
//! Provides a unified error type for all operations.
//!
//! The type is `Clone` because coalesced lifecycle operations (open, close,
//! suspend, resume) hand the same outcome to every waiting caller.

use thiserror::Error;

/// Result type alias using AtlasError
pub type Result<T> = std::result::Result<T, AtlasError>;

/// Unified error type for AtlasKV Native operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AtlasError {
    // -------------------------------------------------------------------------
    // Engine Errors
    // -------------------------------------------------------------------------
    /// Opaque error string reported by the native engine
    #[error("{0}")]
    Engine(String),

    /// A write batch was rejected as a whole by the engine
    #[error("Batch was not applied: {0}")]
    BatchNotApplied(String),

    // -------------------------------------------------------------------------
    // Protocol / Usage Errors
    // -------------------------------------------------------------------------
    #[error("Request already in progress")]
    RequestInProgress,

    #[error("Batch is destroyed")]
    BatchDestroyed,

    #[error("Unknown column family: {0}")]
    UnknownColumnFamily(String),

    #[error("Database session is closed")]
    SessionClosed,

    #[error("Database closed")]
    DatabaseClosed,

    // -------------------------------------------------------------------------
    // Suspension Errors
    // -------------------------------------------------------------------------
    /// The database closed while the operation waited for a resume
    #[error("Database closed before it was resumed")]
    NotResumed,

    // -------------------------------------------------------------------------
    // Encoding Errors
    // -------------------------------------------------------------------------
    #[error("Encoding error: {0}")]
    Encoding(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AtlasError {
    /// True when the operation was abandoned because the database never
    /// resumed. Such operations may be retried once the database is resumed
    /// again; they did not reach the engine.
    pub fn is_suspend_abort(&self) -> bool {
        matches!(self, AtlasError::NotResumed)
    }

    /// True for errors reported by the engine itself
    pub fn is_engine_error(&self) -> bool {
        matches!(self, AtlasError::Engine(_) | AtlasError::BatchNotApplied(_))
    }
}
