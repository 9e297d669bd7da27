//! Error types for the coordination server.

use slotgrid_table::TableError;
use thiserror::Error;

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the coordination server.
#[derive(Debug, Error)]
pub enum Error {
    /// Slot table error (unknown slot, bad table shape)
    #[error("Table error: {0}")]
    Table(#[from] TableError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Inbound message could not be decoded as a request
    #[error("Decode error: {0}")]
    Decode(String),

    /// Connection-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
