//! Eviction order shared by every store backend
//!
//! Candidates are removed greedily in this order until the requested number
//! of bytes is freed:
//!
//! 1. expired messages (`expires_at <= now`), oldest expiry first
//! 2. then ascending priority
//! 3. then oldest creation first
//!
//! Protected messages (own and undelivered) are never candidates. When only
//! protected messages remain, eviction stops short and reports what it
//! actually freed.

use lifeline_protocol::{MessageId, Timestamp};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::message::{MessagePriority, StoredMessage};

/// The fields eviction ranks on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub id: MessageId,
    pub priority: MessagePriority,
    pub size_bytes: u64,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
}

impl From<&StoredMessage> for EvictionCandidate {
    fn from(message: &StoredMessage) -> Self {
        Self {
            id: message.id,
            priority: message.priority,
            size_bytes: message.size_bytes,
            created_at: message.created_at,
            expires_at: message.expires_at,
        }
    }
}

impl EvictionCandidate {
    /// Same boundary as [`StoredMessage::is_expired`]
    fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

/// Outcome of one eviction pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvictionResult {
    pub messages_evicted: usize,
    pub bytes_freed: u64,
    pub by_priority: BTreeMap<MessagePriority, usize>,
    pub evicted_ids: Vec<MessageId>,
    pub duration: Duration,
}

impl EvictionResult {
    pub fn from_evicted(evicted: &[EvictionCandidate], duration: Duration) -> Self {
        let mut result = EvictionResult {
            duration,
            ..Default::default()
        };

        for candidate in evicted {
            result.messages_evicted += 1;
            result.bytes_freed += candidate.size_bytes;
            *result.by_priority.entry(candidate.priority).or_default() += 1;
            result.evicted_ids.push(candidate.id);
        }

        result
    }
}

/// Total order over candidates: first in the order is evicted first
pub fn compare(a: &EvictionCandidate, b: &EvictionCandidate, now: Timestamp) -> Ordering {
    match (a.is_expired(now), b.is_expired(now)) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (true, true) => a.expires_at.cmp(&b.expires_at),
        (false, false) => Ordering::Equal,
    }
    .then_with(|| a.priority.cmp(&b.priority))
    .then_with(|| a.created_at.cmp(&b.created_at))
    .then_with(|| a.id.cmp(&b.id))
}

/// Pick which candidates to remove to free `bytes_to_free`
///
/// `candidates` must already exclude protected messages.
pub fn plan(
    mut candidates: Vec<EvictionCandidate>,
    bytes_to_free: u64,
    now: Timestamp,
) -> Vec<EvictionCandidate> {
    if bytes_to_free == 0 {
        return Vec::new();
    }

    candidates.sort_by(|a, b| compare(a, b, now));

    let mut freed = 0u64;
    let mut selected = Vec::new();
    for candidate in candidates {
        if freed >= bytes_to_free {
            break;
        }
        freed += candidate.size_bytes;
        selected.push(candidate);
    }

    selected
}

/// Candidates from full messages, skipping protected ones
pub fn candidates<'a>(
    messages: impl IntoIterator<Item = &'a StoredMessage>,
) -> Vec<EvictionCandidate> {
    messages
        .into_iter()
        .filter(|m| !m.is_protected())
        .map(EvictionCandidate::from)
        .collect()
}
