//! SQLite-backed message store
//!
//! Each row carries the full [`StoredMessage`] as a bincode blob plus the
//! columns queries and eviction filter on.

use async_trait::async_trait;
use lifeline_protocol::{Clock, MessageId, PeerId, Timestamp};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::eviction::{self, EvictionCandidate, EvictionResult};
use crate::message::{calculate_message_size, MessagePriority, MessageStatus, StoredMessage};
use crate::store::{MessageQuery, MessageStore, StoreStats};

const DB_FILE: &str = "messages.db";

const SELECT_BODY: &str = "SELECT body FROM messages";

/// Persistent message store
pub struct SqliteMessageStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

fn to_sql_ts(timestamp: Timestamp) -> i64 {
    i64::try_from(timestamp).unwrap_or(i64::MAX)
}

fn from_sql_ts(value: i64) -> Timestamp {
    value.max(0) as Timestamp
}

fn message_id(bytes: &[u8]) -> Result<MessageId> {
    let id: [u8; 16] = bytes
        .try_into()
        .map_err(|_| StoreError::CorruptRecord(format!("message id of {} bytes", bytes.len())))?;
    Ok(MessageId::from_bytes(id))
}

fn decode_body(row: &SqliteRow) -> Result<StoredMessage> {
    let body: Vec<u8> = row.try_get("body")?;
    Ok(bincode::deserialize(&body)?)
}

fn decode_priority(value: i64) -> Result<MessagePriority> {
    u8::try_from(value)
        .ok()
        .and_then(MessagePriority::from_u8)
        .ok_or_else(|| StoreError::CorruptRecord(format!("priority {}", value)))
}

fn decode_status(value: &str) -> Result<MessageStatus> {
    MessageStatus::parse(value)
        .ok_or_else(|| StoreError::CorruptRecord(format!("status {}", value)))
}

impl SqliteMessageStore {
    /// Open (or create) the store inside `data_dir`
    pub async fn open(data_dir: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        let db_path = data_dir.join(DB_FILE);
        info!("Opening message store: {}", db_path.display());
        let options = SqlitePoolOptions::new().max_connections(5);
        Self::connect(&format!("sqlite://{}?mode=rwc", db_path.display()), options, clock).await
    }

    /// Private in-memory database, mainly for tests
    pub async fn in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        // The database lives as long as its one connection
        let options = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
        Self::connect("sqlite::memory:", options, clock).await
    }

    async fn connect(url: &str, options: SqlitePoolOptions, clock: Arc<dyn Clock>) -> Result<Self> {
        let pool = options.connect(url).await?;

        Self::migrate(&pool).await?;

        Ok(Self { pool, clock })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id BLOB PRIMARY KEY,
                recipient_id BLOB NOT NULL,
                priority INTEGER NOT NULL,
                status TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                is_own INTEGER NOT NULL,
                destination_zone TEXT,
                body BLOB NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        for index in [
            "CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages (recipient_id)",
            "CREATE INDEX IF NOT EXISTS idx_messages_created ON messages (created_at)",
            "CREATE INDEX IF NOT EXISTS idx_messages_expires ON messages (expires_at)",
            "CREATE INDEX IF NOT EXISTS idx_messages_priority ON messages (priority, created_at)",
        ] {
            sqlx::query(index).execute(pool).await?;
        }

        Ok(())
    }

    async fn upsert<'e, E>(executor: E, mut message: StoredMessage) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        message.size_bytes = calculate_message_size(&message.message);
        let body = bincode::serialize(&message)?;
        let destination_zone = message
            .destination_geo_zone
            .as_ref()
            .map(|z| z.zone_id.clone());

        sqlx::query(
            r#"
            INSERT INTO messages
                (id, recipient_id, priority, status, size_bytes, created_at, expires_at,
                 is_own, destination_zone, body)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                recipient_id = excluded.recipient_id,
                priority = excluded.priority,
                status = excluded.status,
                size_bytes = excluded.size_bytes,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at,
                is_own = excluded.is_own,
                destination_zone = excluded.destination_zone,
                body = excluded.body
            "#,
        )
        .bind(message.id.as_bytes().to_vec())
        .bind(message.recipient_id.as_bytes().to_vec())
        .bind(message.priority.to_u8() as i64)
        .bind(message.status.as_str())
        .bind(message.size_bytes as i64)
        .bind(to_sql_ts(message.created_at))
        .bind(to_sql_ts(message.expires_at))
        .bind(message.is_own_message)
        .bind(destination_zone)
        .bind(body)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Load, change and write back one message in a transaction
    async fn modify<F>(&self, id: &MessageId, change: F) -> Result<bool>
    where
        F: FnOnce(&mut StoredMessage) -> bool + Send,
    {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT body FROM messages WHERE id = ?")
            .bind(id.as_bytes().to_vec())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };

        let mut message = decode_body(&row)?;
        if !change(&mut message) {
            return Ok(false);
        }

        Self::upsert(&mut *tx, message).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn fetch_messages(
        &self,
        mut builder: QueryBuilder<'_, Sqlite>,
    ) -> Result<Vec<StoredMessage>> {
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(decode_body).collect()
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn store(&self, message: StoredMessage) -> Result<()> {
        Self::upsert(&self.pool, message).await
    }

    async fn get(&self, id: &MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query("SELECT body FROM messages WHERE id = ?")
            .bind(id.as_bytes().to_vec())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_body).transpose()
    }

    async fn delete(&self, id: &MessageId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id.as_bytes().to_vec())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn has(&self, id: &MessageId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM messages WHERE id = ?")
            .bind(id.as_bytes().to_vec())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn update_status(&self, id: &MessageId, status: MessageStatus) -> Result<bool> {
        let now = self.clock.now_ms();
        self.modify(id, move |m| m.set_status(status, now)).await
    }

    async fn record_attempt(&self, id: &MessageId, peer: PeerId) -> Result<bool> {
        let now = self.clock.now_ms();
        self.modify(id, move |m| {
            m.record_attempt(peer, now);
            true
        })
        .await
    }

    async fn query(&self, query: &MessageQuery) -> Result<Vec<StoredMessage>> {
        let mut builder = QueryBuilder::<Sqlite>::new(SELECT_BODY);
        builder.push(" WHERE 1 = 1");

        if let Some(recipient) = &query.recipient_id {
            builder
                .push(" AND recipient_id = ")
                .push_bind(recipient.as_bytes().to_vec());
        }
        if let Some(min) = query.min_priority {
            builder.push(" AND priority >= ").push_bind(min.to_u8() as i64);
        }
        if let Some(status) = query.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(zone) = &query.destination_zone {
            builder.push(" AND destination_zone = ").push_bind(zone.clone());
        }
        if let Some(own) = query.is_own_message {
            builder.push(" AND is_own = ").push_bind(own);
        }
        if let Some(ts) = query.created_after {
            builder.push(" AND created_at >= ").push_bind(to_sql_ts(ts));
        }
        if let Some(ts) = query.created_before {
            builder.push(" AND created_at < ").push_bind(to_sql_ts(ts));
        }
        if let Some(ts) = query.expires_after {
            builder.push(" AND expires_at >= ").push_bind(to_sql_ts(ts));
        }
        if let Some(ts) = query.expires_before {
            builder.push(" AND expires_at < ").push_bind(to_sql_ts(ts));
        }

        // SQLite needs a LIMIT before OFFSET; -1 means unbounded
        let limit = query.limit.map_or(-1, |l| l as i64);
        builder
            .push(" ORDER BY created_at DESC, id ASC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(query.offset as i64);

        self.fetch_messages(builder).await
    }

    async fn get_for_relay(
        &self,
        exclude: &HashSet<MessageId>,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>> {
        let now = to_sql_ts(self.clock.now_ms());
        let mut builder = QueryBuilder::<Sqlite>::new(SELECT_BODY);
        builder
            .push(" WHERE status NOT IN ('delivered', 'expired') AND expires_at > ")
            .push_bind(now)
            .push(" ORDER BY priority DESC, created_at ASC, id ASC");

        // Exclusions filtered here; the set can exceed SQLite's bind limit
        let mut messages: Vec<StoredMessage> = self
            .fetch_messages(builder)
            .await?
            .into_iter()
            .filter(|m| !exclude.contains(&m.id))
            .collect();

        if let Some(limit) = limit {
            messages.truncate(limit);
        }
        Ok(messages)
    }

    async fn get_pending_for_recipient(&self, recipient: &PeerId) -> Result<Vec<StoredMessage>> {
        let now = to_sql_ts(self.clock.now_ms());
        let mut builder = QueryBuilder::<Sqlite>::new(SELECT_BODY);
        builder
            .push(" WHERE recipient_id = ")
            .push_bind(recipient.as_bytes().to_vec())
            .push(" AND status NOT IN ('delivered', 'expired') AND expires_at > ")
            .push_bind(now)
            .push(" ORDER BY created_at ASC, id ASC");
        self.fetch_messages(builder).await
    }

    async fn get_expired(&self) -> Result<Vec<StoredMessage>> {
        let now = to_sql_ts(self.clock.now_ms());
        let mut builder = QueryBuilder::<Sqlite>::new(SELECT_BODY);
        builder
            .push(" WHERE expires_at <= ")
            .push_bind(now)
            .push(" ORDER BY expires_at ASC, id ASC");
        self.fetch_messages(builder).await
    }

    async fn bulk_store(&self, messages: Vec<StoredMessage>) -> Result<usize> {
        let count = messages.len();
        let mut tx = self.pool.begin().await?;
        for message in messages {
            Self::upsert(&mut *tx, message).await?;
        }
        tx.commit().await?;
        Ok(count)
    }

    async fn bulk_delete(&self, ids: &[MessageId]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;
        for id in ids {
            let result = sqlx::query("DELETE FROM messages WHERE id = ?")
                .bind(id.as_bytes().to_vec())
                .execute(&mut *tx)
                .await?;
            deleted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(deleted)
    }

    async fn get_all_ids(&self) -> Result<Vec<MessageId>> {
        let rows = sqlx::query("SELECT id FROM messages ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let bytes: Vec<u8> = row.try_get("id")?;
                message_id(&bytes)
            })
            .collect()
    }

    async fn get_messages_since(&self, since: Timestamp) -> Result<Vec<StoredMessage>> {
        let mut builder = QueryBuilder::<Sqlite>::new(SELECT_BODY);
        builder
            .push(" WHERE created_at > ")
            .push_bind(to_sql_ts(since))
            .push(" ORDER BY created_at ASC, id ASC");
        self.fetch_messages(builder).await
    }

    async fn get_stats(&self) -> Result<StoreStats> {
        let rows = sqlx::query(
            "SELECT priority, status, size_bytes, created_at, is_own FROM messages",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = StoreStats::default();
        for row in &rows {
            let status: String = row.try_get("status")?;
            stats.record(
                decode_priority(row.try_get("priority")?)?,
                decode_status(&status)?,
                row.try_get::<i64, _>("size_bytes")?.max(0) as u64,
                from_sql_ts(row.try_get("created_at")?),
                row.try_get("is_own")?,
            );
        }
        Ok(stats)
    }

    async fn evict_by_priority(&self, bytes_to_free: u64) -> Result<EvictionResult> {
        let started = Instant::now();
        let now = self.clock.now_ms();
        let mut tx = self.pool.begin().await?;

        // Protected rows (own, not yet delivered or expired) are never candidates
        let rows = sqlx::query(
            r#"
            SELECT id, priority, size_bytes, created_at, expires_at FROM messages
            WHERE NOT (is_own = 1 AND status NOT IN ('delivered', 'expired'))
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: Vec<u8> = row.try_get("id")?;
            candidates.push(EvictionCandidate {
                id: message_id(&id)?,
                priority: decode_priority(row.try_get("priority")?)?,
                size_bytes: row.try_get::<i64, _>("size_bytes")?.max(0) as u64,
                created_at: from_sql_ts(row.try_get("created_at")?),
                expires_at: from_sql_ts(row.try_get("expires_at")?),
            });
        }

        let selected = eviction::plan(candidates, bytes_to_free, now);
        for candidate in &selected {
            sqlx::query("DELETE FROM messages WHERE id = ?")
                .bind(candidate.id.as_bytes().to_vec())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        let result = EvictionResult::from_evicted(&selected, started.elapsed());
        debug!(
            "Evicted {} messages ({} bytes, {} requested)",
            result.messages_evicted, result.bytes_freed, bytes_to_free
        );
        Ok(result)
    }

    async fn prune_expired(&self, now: Timestamp) -> Result<usize> {
        let result = sqlx::query("DELETE FROM messages WHERE expires_at <= ?")
            .bind(to_sql_ts(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM messages")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
