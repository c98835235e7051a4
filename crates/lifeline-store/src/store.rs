//! Message store contract

use async_trait::async_trait;
use lifeline_protocol::{MessageId, PeerId, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use crate::error::Result;
use crate::eviction::EvictionResult;
use crate::message::{MessagePriority, MessageStatus, StoredMessage};

/// Filter for [`MessageStore::query`]
///
/// Every set field must match. Time bounds are inclusive below and exclusive
/// above. Results come newest-created first.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub recipient_id: Option<PeerId>,
    pub min_priority: Option<MessagePriority>,
    pub status: Option<MessageStatus>,
    /// Matches the destination zone's locator
    pub destination_zone: Option<String>,
    pub is_own_message: Option<bool>,
    pub created_after: Option<Timestamp>,
    pub created_before: Option<Timestamp>,
    pub expires_after: Option<Timestamp>,
    pub expires_before: Option<Timestamp>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl MessageQuery {
    pub fn matches(&self, message: &StoredMessage) -> bool {
        if let Some(recipient) = &self.recipient_id {
            if &message.recipient_id != recipient {
                return false;
            }
        }
        if let Some(min) = self.min_priority {
            if message.priority < min {
                return false;
            }
        }
        if let Some(status) = self.status {
            if message.status != status {
                return false;
            }
        }
        if let Some(zone) = &self.destination_zone {
            match &message.destination_geo_zone {
                Some(dest) if &dest.zone_id == zone => {}
                _ => return false,
            }
        }
        if let Some(own) = self.is_own_message {
            if message.is_own_message != own {
                return false;
            }
        }

        in_window(message.created_at, self.created_after, self.created_before)
            && in_window(message.expires_at, self.expires_after, self.expires_before)
    }
}

fn in_window(value: Timestamp, from: Option<Timestamp>, until: Option<Timestamp>) -> bool {
    from.map_or(true, |from| value >= from) && until.map_or(true, |until| value < until)
}

/// Newest created first, ties by ID
pub fn newest_first(a: &StoredMessage, b: &StoredMessage) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

/// Highest priority first, then oldest
pub fn relay_order(a: &StoredMessage, b: &StoredMessage) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Aggregate view of a store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_messages: usize,
    pub total_bytes: u64,
    pub by_priority: BTreeMap<MessagePriority, usize>,
    pub by_status: BTreeMap<MessageStatus, usize>,
    pub oldest_message: Option<Timestamp>,
    pub newest_message: Option<Timestamp>,
    pub own_messages: usize,
    pub relay_messages: usize,
}

impl StoreStats {
    /// Fold one message into the totals
    pub fn record(
        &mut self,
        priority: MessagePriority,
        status: MessageStatus,
        size_bytes: u64,
        created_at: Timestamp,
        is_own_message: bool,
    ) {
        self.total_messages += 1;
        self.total_bytes += size_bytes;
        *self.by_priority.entry(priority).or_default() += 1;
        *self.by_status.entry(status).or_default() += 1;
        self.oldest_message = Some(self.oldest_message.map_or(created_at, |t| t.min(created_at)));
        self.newest_message = Some(self.newest_message.map_or(created_at, |t| t.max(created_at)));

        if is_own_message {
            self.own_messages += 1;
        } else {
            self.relay_messages += 1;
        }
    }

    pub fn from_messages<'a>(messages: impl IntoIterator<Item = &'a StoredMessage>) -> Self {
        let mut stats = StoreStats::default();
        for m in messages {
            stats.record(m.priority, m.status, m.size_bytes, m.created_at, m.is_own_message);
        }
        stats
    }
}

/// Storage backend for stored messages
///
/// Backends must honour the eviction order in [`crate::eviction`] and never
/// evict a protected message. Operations on a missing ID are no-ops that
/// report `false` rather than errors.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert or replace; `size_bytes` is recomputed
    async fn store(&self, message: StoredMessage) -> Result<()>;

    async fn get(&self, id: &MessageId) -> Result<Option<StoredMessage>>;

    async fn delete(&self, id: &MessageId) -> Result<bool>;

    async fn has(&self, id: &MessageId) -> Result<bool>;

    /// False if the ID is unknown or the lifecycle forbids the move
    async fn update_status(&self, id: &MessageId, status: MessageStatus) -> Result<bool>;

    /// False if the ID is unknown
    async fn record_attempt(&self, id: &MessageId, peer: PeerId) -> Result<bool>;

    async fn query(&self, query: &MessageQuery) -> Result<Vec<StoredMessage>>;

    /// Relay-eligible messages not in `exclude`, highest priority first
    async fn get_for_relay(
        &self,
        exclude: &HashSet<MessageId>,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>>;

    /// Undelivered, unexpired messages for `recipient`, oldest first
    async fn get_pending_for_recipient(&self, recipient: &PeerId) -> Result<Vec<StoredMessage>>;

    async fn get_expired(&self) -> Result<Vec<StoredMessage>>;

    async fn bulk_store(&self, messages: Vec<StoredMessage>) -> Result<usize>;

    async fn bulk_delete(&self, ids: &[MessageId]) -> Result<usize>;

    async fn get_all_ids(&self) -> Result<Vec<MessageId>>;

    /// Messages created strictly after `since`, oldest first
    async fn get_messages_since(&self, since: Timestamp) -> Result<Vec<StoredMessage>>;

    async fn get_stats(&self) -> Result<StoreStats>;

    /// Free at least `bytes_to_free` if unprotected messages allow it
    async fn evict_by_priority(&self, bytes_to_free: u64) -> Result<EvictionResult>;

    /// Delete every message expired at `now`, protected or not
    async fn prune_expired(&self, now: Timestamp) -> Result<usize>;

    async fn clear(&self) -> Result<()>;
}
