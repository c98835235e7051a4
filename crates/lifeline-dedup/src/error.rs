//! Deduplication error types

use thiserror::Error;

/// Deduplication-specific errors
#[derive(Error, Debug)]
pub enum DedupError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Incompatible filters: size {size}/{other_size}, hash count {hash_count}/{other_hash_count}")]
    IncompatibleFilter {
        size: usize,
        other_size: usize,
        hash_count: u32,
        other_hash_count: u32,
    },

    #[error("Invalid filter snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("Corrupt log entry: {0}")]
    CorruptEntry(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for deduplication operations
pub type Result<T> = std::result::Result<T, DedupError>;
