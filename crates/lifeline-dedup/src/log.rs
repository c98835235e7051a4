//! Exact record of processed message IDs
//!
//! The log is the source of truth behind the Bloom filter. Implementations
//! must treat `save` as an upsert keyed by message ID: saving the same ID
//! twice leaves a single entry.

use async_trait::async_trait;
use lifeline_protocol::{MessageId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::Result;

/// A previously processed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub message_id: MessageId,
    pub seen_at: Timestamp,
}

/// Persistence for seen message IDs
#[async_trait]
pub trait DedupLog: Send + Sync {
    /// Insert or refresh an entry
    async fn save(&self, entry: LogEntry) -> Result<()>;

    async fn has(&self, message_id: &MessageId) -> Result<bool>;

    /// Drop a single entry; `false` if it was not present
    async fn remove(&self, message_id: &MessageId) -> Result<bool>;

    async fn get_all(&self) -> Result<Vec<LogEntry>>;

    /// Entries with `seen_at` strictly after `timestamp`
    async fn get_newer_than(&self, timestamp: Timestamp) -> Result<Vec<LogEntry>>;

    /// Remove entries with `seen_at` strictly before `timestamp`
    async fn delete_older_than(&self, timestamp: Timestamp) -> Result<usize>;

    async fn count(&self) -> Result<usize>;

    async fn clear(&self) -> Result<()>;
}

/// Volatile log for tests and nodes without persistent storage
#[derive(Debug, Default)]
pub struct MemoryDedupLog {
    entries: RwLock<HashMap<MessageId, Timestamp>>,
}

impl MemoryDedupLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupLog for MemoryDedupLog {
    async fn save(&self, entry: LogEntry) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(entry.message_id, entry.seen_at);
        Ok(())
    }

    async fn has(&self, message_id: &MessageId) -> Result<bool> {
        Ok(self.entries.read().await.contains_key(message_id))
    }

    async fn remove(&self, message_id: &MessageId) -> Result<bool> {
        Ok(self.entries.write().await.remove(message_id).is_some())
    }

    async fn get_all(&self) -> Result<Vec<LogEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .map(|(message_id, seen_at)| LogEntry {
                message_id: *message_id,
                seen_at: *seen_at,
            })
            .collect())
    }

    async fn get_newer_than(&self, timestamp: Timestamp) -> Result<Vec<LogEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|(_, seen_at)| **seen_at > timestamp)
            .map(|(message_id, seen_at)| LogEntry {
                message_id: *message_id,
                seen_at: *seen_at,
            })
            .collect())
    }

    async fn delete_older_than(&self, timestamp: Timestamp) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, seen_at| *seen_at >= timestamp);
        Ok(before - entries.len())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }
}
