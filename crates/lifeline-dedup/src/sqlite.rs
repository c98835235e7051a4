//! SQLite-backed dedup log

use async_trait::async_trait;
use lifeline_protocol::{MessageId, Timestamp};
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use std::path::Path;
use tracing::info;

use crate::error::{DedupError, Result};
use crate::log::{DedupLog, LogEntry};

const DB_FILE: &str = "dedup.db";

/// Persistent dedup log; survives restarts
pub struct SqliteDedupLog {
    pool: SqlitePool,
}

impl SqliteDedupLog {
    /// Open (or create) the log inside `data_dir`
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join(DB_FILE);
        info!("Opening dedup log: {}", db_path.display());
        let options = SqlitePoolOptions::new().max_connections(5);
        Self::connect(&format!("sqlite://{}?mode=rwc", db_path.display()), options).await
    }

    /// Private in-memory database, mainly for tests
    pub async fn in_memory() -> Result<Self> {
        // Every connection to :memory: is its own database, so the single
        // connection must never be closed or recycled
        let options = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
        Self::connect("sqlite::memory:", options).await
    }

    async fn connect(url: &str, options: SqlitePoolOptions) -> Result<Self> {
        let pool = options.connect(url).await?;

        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dedup_log (
                message_id BLOB PRIMARY KEY,
                seen_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_dedup_log_seen_at ON dedup_log (seen_at)")
            .execute(pool)
            .await?;

        Ok(())
    }

    fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<LogEntry> {
        let id_bytes: Vec<u8> = row.try_get("message_id")?;
        let seen_at: i64 = row.try_get("seen_at")?;

        let id: [u8; 16] = id_bytes.as_slice().try_into().map_err(|_| {
            DedupError::CorruptEntry(format!("message id of {} bytes", id_bytes.len()))
        })?;

        Ok(LogEntry {
            message_id: MessageId::from_bytes(id),
            seen_at: seen_at.max(0) as Timestamp,
        })
    }
}

fn to_sql_ts(timestamp: Timestamp) -> i64 {
    i64::try_from(timestamp).unwrap_or(i64::MAX)
}

#[async_trait]
impl DedupLog for SqliteDedupLog {
    async fn save(&self, entry: LogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dedup_log (message_id, seen_at) VALUES (?, ?)
            ON CONFLICT(message_id) DO UPDATE SET seen_at = excluded.seen_at
            "#,
        )
        .bind(entry.message_id.as_bytes().as_slice())
        .bind(to_sql_ts(entry.seen_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn has(&self, message_id: &MessageId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM dedup_log WHERE message_id = ?")
            .bind(message_id.as_bytes().as_slice())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn remove(&self, message_id: &MessageId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM dedup_log WHERE message_id = ?")
            .bind(message_id.as_bytes().as_slice())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_all(&self) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query("SELECT message_id, seen_at FROM dedup_log")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn get_newer_than(&self, timestamp: Timestamp) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query("SELECT message_id, seen_at FROM dedup_log WHERE seen_at > ?")
            .bind(to_sql_ts(timestamp))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn delete_older_than(&self, timestamp: Timestamp) -> Result<usize> {
        let result = sqlx::query("DELETE FROM dedup_log WHERE seen_at < ?")
            .bind(to_sql_ts(timestamp))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn count(&self) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) FROM dedup_log")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count as usize)
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM dedup_log")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(seed: u8) -> MessageId {
        MessageId::from_bytes([seed; 16])
    }

    #[tokio::test]
    async fn test_upsert_and_lookup() {
        let log = SqliteDedupLog::in_memory().await.unwrap();

        log.save(LogEntry { message_id: id(1), seen_at: 10 }).await.unwrap();
        log.save(LogEntry { message_id: id(1), seen_at: 20 }).await.unwrap();
        log.save(LogEntry { message_id: id(2), seen_at: 30 }).await.unwrap();

        assert_eq!(log.count().await.unwrap(), 2);
        assert!(log.has(&id(1)).await.unwrap());
        assert!(!log.has(&id(3)).await.unwrap());

        let newer = log.get_newer_than(15).await.unwrap();
        assert_eq!(newer.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_older_than() {
        let log = SqliteDedupLog::in_memory().await.unwrap();
        for seed in 0..5u8 {
            log.save(LogEntry { message_id: id(seed), seen_at: seed as u64 * 100 })
                .await
                .unwrap();
        }

        assert_eq!(log.delete_older_than(250).await.unwrap(), 3);
        assert_eq!(log.count().await.unwrap(), 2);

        log.clear().await.unwrap();
        assert!(log.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove() {
        let log = SqliteDedupLog::in_memory().await.unwrap();
        log.save(LogEntry { message_id: id(1), seen_at: 10 }).await.unwrap();

        assert!(log.remove(&id(1)).await.unwrap());
        assert!(!log.remove(&id(1)).await.unwrap());
        assert_eq!(log.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let log = SqliteDedupLog::open(dir.path()).await.unwrap();
            log.save(LogEntry { message_id: id(7), seen_at: 1 }).await.unwrap();
        }

        let reopened = SqliteDedupLog::open(dir.path()).await.unwrap();
        assert!(reopened.has(&id(7)).await.unwrap());
    }
}
