//! In-memory message store

use async_trait::async_trait;
use lifeline_protocol::{Clock, MessageId, PeerId, Timestamp};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;
use crate::eviction::{self, EvictionResult};
use crate::message::{calculate_message_size, MessageStatus, StoredMessage};
use crate::store::{newest_first, relay_order, MessageQuery, MessageStore, StoreStats};

/// Volatile store backed by a hash map
pub struct MemoryMessageStore {
    messages: RwLock<HashMap<MessageId, StoredMessage>>,
    clock: Arc<dyn Clock>,
}

impl MemoryMessageStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            messages: RwLock::new(HashMap::new()),
            clock,
        }
    }

    async fn collect_sorted<F>(
        &self,
        predicate: F,
        order: fn(&StoredMessage, &StoredMessage) -> std::cmp::Ordering,
    ) -> Vec<StoredMessage>
    where
        F: Fn(&StoredMessage) -> bool,
    {
        let messages = self.messages.read().await;
        let mut matched: Vec<StoredMessage> =
            messages.values().filter(|m| predicate(*m)).cloned().collect();
        matched.sort_by(order);
        matched
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn store(&self, mut message: StoredMessage) -> Result<()> {
        message.size_bytes = calculate_message_size(&message.message);
        self.messages.write().await.insert(message.id, message);
        Ok(())
    }

    async fn get(&self, id: &MessageId) -> Result<Option<StoredMessage>> {
        Ok(self.messages.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &MessageId) -> Result<bool> {
        Ok(self.messages.write().await.remove(id).is_some())
    }

    async fn has(&self, id: &MessageId) -> Result<bool> {
        Ok(self.messages.read().await.contains_key(id))
    }

    async fn update_status(&self, id: &MessageId, status: MessageStatus) -> Result<bool> {
        let now = self.clock.now_ms();
        Ok(self
            .messages
            .write()
            .await
            .get_mut(id)
            .map_or(false, |m| m.set_status(status, now)))
    }

    async fn record_attempt(&self, id: &MessageId, peer: PeerId) -> Result<bool> {
        let now = self.clock.now_ms();
        let mut messages = self.messages.write().await;
        match messages.get_mut(id) {
            Some(message) => {
                message.record_attempt(peer, now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn query(&self, query: &MessageQuery) -> Result<Vec<StoredMessage>> {
        let matched = self.collect_sorted(|m| query.matches(m), newest_first).await;

        Ok(matched
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn get_for_relay(
        &self,
        exclude: &HashSet<MessageId>,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>> {
        let now = self.clock.now_ms();
        let mut matched = self
            .collect_sorted(
                |m| m.is_relay_eligible(now) && !exclude.contains(&m.id),
                relay_order,
            )
            .await;

        if let Some(limit) = limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn get_pending_for_recipient(&self, recipient: &PeerId) -> Result<Vec<StoredMessage>> {
        let now = self.clock.now_ms();
        Ok(self
            .collect_sorted(
                |m| &m.recipient_id == recipient && m.is_relay_eligible(now),
                |a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)),
            )
            .await)
    }

    async fn get_expired(&self) -> Result<Vec<StoredMessage>> {
        let now = self.clock.now_ms();
        Ok(self
            .collect_sorted(
                |m| m.is_expired(now),
                |a, b| a.expires_at.cmp(&b.expires_at).then_with(|| a.id.cmp(&b.id)),
            )
            .await)
    }

    async fn bulk_store(&self, messages: Vec<StoredMessage>) -> Result<usize> {
        let mut stored = self.messages.write().await;
        let count = messages.len();
        for mut message in messages {
            message.size_bytes = calculate_message_size(&message.message);
            stored.insert(message.id, message);
        }
        Ok(count)
    }

    async fn bulk_delete(&self, ids: &[MessageId]) -> Result<usize> {
        let mut messages = self.messages.write().await;
        Ok(ids.iter().filter(|id| messages.remove(*id).is_some()).count())
    }

    async fn get_all_ids(&self) -> Result<Vec<MessageId>> {
        let mut ids: Vec<MessageId> = self.messages.read().await.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_messages_since(&self, since: Timestamp) -> Result<Vec<StoredMessage>> {
        Ok(self
            .collect_sorted(
                |m| m.created_at > since,
                |a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)),
            )
            .await)
    }

    async fn get_stats(&self) -> Result<StoreStats> {
        Ok(StoreStats::from_messages(self.messages.read().await.values()))
    }

    async fn evict_by_priority(&self, bytes_to_free: u64) -> Result<EvictionResult> {
        let started = Instant::now();
        let now = self.clock.now_ms();
        let mut messages = self.messages.write().await;

        let selected = eviction::plan(eviction::candidates(messages.values()), bytes_to_free, now);
        for candidate in &selected {
            messages.remove(&candidate.id);
        }

        let result = EvictionResult::from_evicted(&selected, started.elapsed());
        debug!(
            "Evicted {} messages ({} bytes, {} requested)",
            result.messages_evicted, result.bytes_freed, bytes_to_free
        );
        Ok(result)
    }

    async fn prune_expired(&self, now: Timestamp) -> Result<usize> {
        let mut messages = self.messages.write().await;
        let before = messages.len();
        messages.retain(|_, m| !m.is_expired(now));
        Ok(before - messages.len())
    }

    async fn clear(&self) -> Result<()> {
        self.messages.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support;
    use lifeline_protocol::ManualClock;

    #[tokio::test]
    async fn test_store_contract() {
        let clock = Arc::new(ManualClock::new(test_support::T0));
        let store = MemoryMessageStore::new(clock.clone());
        test_support::exercise_contract(&store, &clock).await;
    }

    #[tokio::test]
    async fn test_eviction_contract() {
        let clock = Arc::new(ManualClock::new(test_support::T0));
        let store = MemoryMessageStore::new(clock.clone());
        test_support::exercise_eviction(&store, &clock).await;
    }
}
