//! Error types for the tablet store
//!
//! Provides a unified error type for all operations. Every public tablet
//! operation returns one of these; callers branch on the predicates below
//! rather than matching on message text.

use thiserror::Error;

/// Result type alias using TabletError
pub type Result<T> = std::result::Result<T, TabletError>;

/// Unified error type for tablet operations
#[derive(Debug, Error)]
pub enum TabletError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Row Lookup Errors
    // -------------------------------------------------------------------------
    #[error("Key not found")]
    KeyNotFound,

    #[error("Key already present")]
    AlreadyPresent,

    // -------------------------------------------------------------------------
    // On-disk State Errors
    // -------------------------------------------------------------------------
    #[error("Corruption: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Flush / Compaction Errors
    // -------------------------------------------------------------------------
    #[error("Operation aborted: {0}")]
    Aborted(String),
}

impl TabletError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, TabletError::KeyNotFound)
    }

    pub fn is_already_present(&self) -> bool {
        matches!(self, TabletError::AlreadyPresent)
    }

    pub fn is_io_error(&self) -> bool {
        matches!(self, TabletError::Io(_))
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, TabletError::Corruption(_))
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, TabletError::InvalidArgument(_))
    }
}

impl From<bincode::Error> for TabletError {
    fn from(e: bincode::Error) -> Self {
        TabletError::Serialization(e.to_string())
    }
}
