//! Stored message model

use lifeline_geo::GeoZone;
use lifeline_protocol::message::HEADER_SIZE;
use lifeline_protocol::{MessageId, PeerId, Timestamp, WireMessage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Fixed per-message allowance for indexes and bookkeeping
pub const METADATA_OVERHEAD: usize = 256;

const HOUR: u64 = 3600;
const DAY: u64 = 24 * HOUR;

/// Storage priority, ascending importance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessagePriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Emergency = 3,
}

impl MessagePriority {
    pub const ALL: [MessagePriority; 4] = [
        MessagePriority::Low,
        MessagePriority::Normal,
        MessagePriority::High,
        MessagePriority::Emergency,
    ];

    /// Time a message of this priority is kept
    pub fn ttl(&self) -> Duration {
        match self {
            MessagePriority::Low => Duration::from_secs(DAY),
            MessagePriority::Normal => Duration::from_secs(7 * DAY),
            MessagePriority::High => Duration::from_secs(14 * DAY),
            MessagePriority::Emergency => Duration::from_secs(30 * DAY),
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessagePriority::Low),
            1 => Some(MessagePriority::Normal),
            2 => Some(MessagePriority::High),
            3 => Some(MessagePriority::Emergency),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl Default for MessagePriority {
    fn default() -> Self {
        MessagePriority::Normal
    }
}

/// Delivery state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Expired,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Delivered | MessageStatus::Expired)
    }

    /// Allowed lifecycle moves; terminal states never change
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;

        match (self, next) {
            (Delivered | Expired, _) => false,
            (Pending, Sent | Delivered | Failed | Expired) => true,
            (Sent, Pending | Delivered | Failed | Expired) => true,
            (Failed, Pending | Sent | Expired) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
            MessageStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageStatus::Pending),
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "failed" => Some(MessageStatus::Failed),
            "expired" => Some(MessageStatus::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message held for delivery or relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub message: WireMessage,
    /// Destination peer, or [`PeerId::BROADCAST`]
    pub recipient_id: PeerId,
    pub priority: MessagePriority,
    /// Quota footprint, recomputed on every write
    pub size_bytes: u64,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub status: MessageStatus,

    // Relay bookkeeping
    pub attempts: u32,
    pub last_attempt: Option<Timestamp>,
    pub route_attempts: BTreeSet<PeerId>,
    pub hop_count: u8,
    pub max_hops: u8,

    pub geo_zone: Option<GeoZone>,
    pub destination_geo_zone: Option<GeoZone>,

    /// Originated on this device (as opposed to held for relay)
    pub is_own_message: bool,
    pub relayed_at: Option<Timestamp>,
    pub delivered_at: Option<Timestamp>,
}

impl StoredMessage {
    /// Expired from the `expires_at` instant on; the message is live only
    /// while `now < expires_at`. Store queries use the same boundary.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Still worth forwarding
    pub fn is_relay_eligible(&self, now: Timestamp) -> bool {
        !self.status.is_terminal() && !self.is_expired(now)
    }

    /// Own message not yet delivered; never evicted for quota relief
    pub fn is_protected(&self) -> bool {
        self.is_own_message && !self.status.is_terminal()
    }

    pub fn has_hops_remaining(&self) -> bool {
        self.hop_count < self.max_hops
    }

    pub fn ttl_remaining(&self, now: Timestamp) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now))
    }

    /// Apply a status change if the lifecycle allows it
    pub fn set_status(&mut self, status: MessageStatus, now: Timestamp) -> bool {
        if !self.status.can_transition_to(status) {
            return false;
        }

        self.status = status;
        if status == MessageStatus::Delivered {
            self.delivered_at = Some(now);
        }
        true
    }

    pub fn record_attempt(&mut self, peer: PeerId, now: Timestamp) {
        self.attempts += 1;
        self.last_attempt = Some(now);
        self.route_attempts.insert(peer);
    }

    pub fn mark_delivered(&mut self, now: Timestamp) -> bool {
        self.set_status(MessageStatus::Delivered, now)
    }
}

/// Options for [`create_stored_message`]
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub priority: MessagePriority,
    pub is_own_message: bool,
    pub hop_count: u8,
    /// Defaults to the wire header's hop budget
    pub max_hops: Option<u8>,
    pub geo_zone: Option<GeoZone>,
    pub destination_geo_zone: Option<GeoZone>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            priority: MessagePriority::Normal,
            is_own_message: true,
            hop_count: 0,
            max_hops: None,
            geo_zone: None,
            destination_geo_zone: None,
        }
    }
}

impl StoreOptions {
    /// Options for a message received from a peer for forwarding
    pub fn relay(priority: MessagePriority) -> Self {
        Self {
            priority,
            is_own_message: false,
            ..Default::default()
        }
    }
}

/// Quota footprint: header + payload + fixed metadata allowance
pub fn calculate_message_size(message: &WireMessage) -> u64 {
    (HEADER_SIZE + message.payload.len() + METADATA_OVERHEAD) as u64
}

/// Wrap a wire message for storage
pub fn create_stored_message(
    message: WireMessage,
    recipient_id: PeerId,
    options: StoreOptions,
    now: Timestamp,
) -> StoredMessage {
    let ttl_ms = options.priority.ttl().as_millis() as u64;

    StoredMessage {
        id: message.id(),
        size_bytes: calculate_message_size(&message),
        recipient_id,
        priority: options.priority,
        created_at: now,
        expires_at: now + ttl_ms,
        status: MessageStatus::Pending,
        attempts: 0,
        last_attempt: None,
        route_attempts: BTreeSet::new(),
        hop_count: options.hop_count,
        max_hops: options.max_hops.unwrap_or(message.header.ttl),
        geo_zone: options.geo_zone,
        destination_geo_zone: options.destination_geo_zone,
        is_own_message: options.is_own_message,
        relayed_at: if options.is_own_message { None } else { Some(now) },
        delivered_at: None,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifeline_protocol::MessageType;

    const NOW: Timestamp = 1_700_000_000_000;

    fn wire(payload: &[u8]) -> WireMessage {
        WireMessage::new(PeerId::from_bytes([1; 32]), MessageType::Text, NOW, payload.to_vec())
            .unwrap()
    }

    #[test]
    fn test_ttl_by_priority() {
        for priority in MessagePriority::ALL {
            let options = StoreOptions {
                priority,
                ..Default::default()
            };
            let stored = create_stored_message(wire(b"x"), PeerId::BROADCAST, options, NOW);
            assert_eq!(
                stored.expires_at - stored.created_at,
                priority.ttl().as_millis() as u64
            );
        }

        assert_eq!(MessagePriority::Low.ttl(), Duration::from_secs(86_400));
        assert_eq!(MessagePriority::Emergency.ttl(), Duration::from_secs(30 * 86_400));
    }

    #[test]
    fn test_defaults() {
        let stored = create_stored_message(
            wire(b"hello"),
            PeerId::from_bytes([2; 32]),
            StoreOptions::default(),
            NOW,
        );

        assert_eq!(stored.priority, MessagePriority::Normal);
        assert_eq!(stored.status, MessageStatus::Pending);
        assert!(stored.is_own_message);
        assert_eq!(stored.relayed_at, None);
        assert_eq!(stored.max_hops, 10);
        assert_eq!(stored.id, stored.message.id());
    }

    #[test]
    fn test_relay_message() {
        let stored = create_stored_message(
            wire(b"hello"),
            PeerId::BROADCAST,
            StoreOptions::relay(MessagePriority::High),
            NOW,
        );

        assert!(!stored.is_own_message);
        assert_eq!(stored.relayed_at, Some(NOW));
        assert!(!stored.is_protected());
    }

    #[test]
    fn test_identical_content_same_id() {
        let a = create_stored_message(wire(b"same"), PeerId::BROADCAST, StoreOptions::default(), NOW);
        let b = create_stored_message(
            wire(b"same"),
            PeerId::BROADCAST,
            StoreOptions::relay(MessagePriority::Low),
            NOW + 5_000,
        );
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_message_size() {
        let message = wire(&[0u8; 1000]);
        assert_eq!(calculate_message_size(&message), (107 + 1000 + 256) as u64);
    }

    #[test]
    fn test_status_transitions() {
        use MessageStatus::*;

        assert!(Pending.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Failed.can_transition_to(Pending));
        assert!(!Delivered.can_transition_to(Pending));
        assert!(!Expired.can_transition_to(Sent));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn test_expiry_boundary() {
        let stored =
            create_stored_message(wire(b"x"), PeerId::BROADCAST, StoreOptions::default(), NOW);
        assert!(!stored.is_expired(stored.expires_at - 1));
        assert!(stored.is_expired(stored.expires_at));
        assert!(stored.is_expired(stored.expires_at + 1));
    }

    #[test]
    fn test_lifecycle_helpers() {
        let mut stored =
            create_stored_message(wire(b"x"), PeerId::BROADCAST, StoreOptions::default(), NOW);
        assert!(stored.is_protected());
        assert!(stored.is_relay_eligible(NOW));
        assert!(!stored.is_relay_eligible(stored.expires_at));

        let peer = PeerId::from_bytes([9; 32]);
        stored.record_attempt(peer, NOW + 1);
        stored.record_attempt(peer, NOW + 2);
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.route_attempts.len(), 1);
        assert_eq!(stored.last_attempt, Some(NOW + 2));

        assert!(stored.mark_delivered(NOW + 3));
        assert_eq!(stored.delivered_at, Some(NOW + 3));
        assert!(!stored.is_protected());
        assert!(!stored.is_relay_eligible(NOW + 3));
        assert!(!stored.set_status(MessageStatus::Pending, NOW + 4));
    }
}
