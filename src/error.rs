//! Error types for referral storage operations

use thiserror::Error;

/// Referral storage error type
#[derive(Debug, Error)]
pub enum Error {
    /// Storage backend error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data not found
    #[error("Data not found: {0}")]
    NotFound(String),

    /// Invalid data
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Referral inserted without a confirmed parent
    #[error("Missing parent referral for {0}")]
    MissingParent(String),

    /// On-disk invariant violated; the database needs a reindex
    #[error("Referral database corruption: {0}")]
    Corruption(String),

    /// Bincode serialization error
    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for referral storage operations
pub type Result<T> = std::result::Result<T, Error>;
