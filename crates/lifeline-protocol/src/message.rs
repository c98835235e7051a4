//! Wire message as seen by the store-and-forward core
//!
//! The core never decodes the payload. It only needs a stable content hash
//! (for deduplication) and a byte footprint (for quota accounting).

use blake2::{Blake2b512, Digest};
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::error::{ProtocolError, Result};
use crate::types::{PeerId, Timestamp, PEER_ID_SIZE};

/// Size of a message ID in bytes
pub const MESSAGE_ID_SIZE: usize = 16;

/// Size of a detached signature in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Encoded header size: version + type + ttl + timestamp + sender + signature
pub const HEADER_SIZE: usize = 1 + 1 + 1 + 8 + PEER_ID_SIZE + SIGNATURE_SIZE;

/// Maximum message payload size (1 MB)
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Current wire protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// A content-derived identifier for a message
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId([u8; MESSAGE_ID_SIZE]);

impl MessageId {
    /// Derive a message ID from message contents
    /// Uses BLAKE2b(sender || timestamp || type || payload)[0:16]
    pub fn generate(
        sender: &PeerId,
        timestamp: Timestamp,
        message_type: MessageType,
        payload: &[u8],
    ) -> Self {
        let mut hasher = Blake2b512::new();

        hasher.update(sender.as_bytes());
        hasher.update(timestamp.to_le_bytes());
        hasher.update([message_type.to_u8()]);
        hasher.update(payload);

        let hash = hasher.finalize();

        let mut id = [0u8; MESSAGE_ID_SIZE];
        id.copy_from_slice(&hash[..MESSAGE_ID_SIZE]);

        MessageId(id)
    }

    /// Create from bytes
    pub fn from_bytes(bytes: [u8; MESSAGE_ID_SIZE]) -> Self {
        MessageId(bytes)
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_SIZE] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes =
            hex::decode(s).map_err(|e| ProtocolError::DeserializationFailed(e.to_string()))?;

        if bytes.len() != MESSAGE_ID_SIZE {
            return Err(ProtocolError::InvalidMessageId);
        }

        let mut arr = [0u8; MESSAGE_ID_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(MessageId(arr))
    }
}

impl AsRef<[u8]> for MessageId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageId({}...)", &self.to_hex()[..12])
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..12])
    }
}

/// Message type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Chat text (0x01)
    Text = 0x01,
    /// Part of a chunked file transfer (0x02)
    FileChunk = 0x02,
    /// Delivery acknowledgment (0x03)
    Ack = 0x03,
    /// Peer presence announcement (0x04)
    Presence = 0x04,
    /// Protocol control message (0x05)
    Control = 0x05,
    /// Emergency broadcast (0x06)
    Sos = 0x06,
}

impl MessageType {
    /// Create from u8
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(MessageType::Text),
            0x02 => Ok(MessageType::FileChunk),
            0x03 => Ok(MessageType::Ack),
            0x04 => Ok(MessageType::Presence),
            0x05 => Ok(MessageType::Control),
            0x06 => Ok(MessageType::Sos),
            _ => Err(ProtocolError::InvalidMessageType(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Fixed-size message header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub version: u8,
    pub message_type: MessageType,
    /// Hop budget carried on the wire
    pub ttl: u8,
    pub timestamp: Timestamp,
    pub sender_id: PeerId,
    #[serde(with = "BigArray")]
    pub signature: [u8; SIGNATURE_SIZE],
}

/// Opaque wire message: header plus encrypted payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

impl WireMessage {
    /// Create an unsigned message; signing happens outside the core
    pub fn new(
        sender_id: PeerId,
        message_type: MessageType,
        timestamp: Timestamp,
        payload: Vec<u8>,
    ) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(WireMessage {
            header: MessageHeader {
                version: PROTOCOL_VERSION,
                message_type,
                ttl: 10,
                timestamp,
                sender_id,
                signature: [0u8; SIGNATURE_SIZE],
            },
            payload,
        })
    }

    /// Set hop budget
    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.header.ttl = ttl;
        self
    }

    /// Attach a detached signature produced by the crypto layer
    pub fn with_signature(mut self, signature: [u8; SIGNATURE_SIZE]) -> Self {
        self.header.signature = signature;
        self
    }

    /// Content-derived ID; identical content always yields the identical ID
    pub fn id(&self) -> MessageId {
        MessageId::generate(
            &self.header.sender_id,
            self.header.timestamp,
            self.header.message_type,
            &self.payload,
        )
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}
