//! Relay node error types

use thiserror::Error;

/// Errors surfaced by [`crate::RelayNode`]
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Deduplication error: {0}")]
    Dedup(#[from] lifeline_dedup::DedupError),

    #[error("Store error: {0}")]
    Store(#[from] lifeline_store::StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
