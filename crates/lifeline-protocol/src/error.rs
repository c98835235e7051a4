//! Error types for protocol operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid message ID")]
    InvalidMessageId,

    #[error("Invalid peer ID")]
    InvalidPeerId,

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),
}
