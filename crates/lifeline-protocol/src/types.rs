//! Core protocol types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a peer ID in bytes (32 bytes / 256 bits)
pub const PEER_ID_SIZE: usize = 32;

/// Unix time in milliseconds
pub type Timestamp = u64;

/// A unique identifier for a peer in the Lifeline mesh
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_SIZE]);

impl PeerId {
    /// Recipient sentinel for messages addressed to every peer
    pub const BROADCAST: PeerId = PeerId([0xFF; PEER_ID_SIZE]);

    /// Create a PeerId from a byte array
    pub fn from_bytes(bytes: [u8; PEER_ID_SIZE]) -> Self {
        PeerId(bytes)
    }

    /// Get the bytes of this PeerId
    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }

    /// Whether this is the broadcast sentinel
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        let bytes = hex::decode(s).map_err(|_| crate::ProtocolError::InvalidPeerId)?;

        if bytes.len() != PEER_ID_SIZE {
            return Err(crate::ProtocolError::InvalidPeerId);
        }

        let mut arr = [0u8; PEER_ID_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(PeerId(arr))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            return write!(f, "PeerId(broadcast)");
        }
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            return write!(f, "broadcast");
        }
        write!(f, "{}", &self.to_hex()[..16])
    }
}
