//! Deduplication manager
//!
//! Composes a [`BloomFilter`] with a [`DedupLog`]. Distinct messages are
//! answered from the filter alone; only a "maybe seen" answer touches the
//! log, which decides between a true duplicate and a false positive.

use lifeline_protocol::{Clock, MessageId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::bloom::{BloomFilter, BloomSnapshot};
use crate::error::{DedupError, Result};
use crate::log::{DedupLog, LogEntry};

/// Share of filter capacity that, once pruned, triggers a rebuild
const REBUILD_PRUNE_FRACTION: f64 = 0.10;

/// Deduplication configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Items the filter is sized for
    pub expected_items: usize,
    pub false_positive_rate: f64,
    /// Log entries older than this are pruned
    pub retention_secs: u64,
    pub prune_interval_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            expected_items: 100_000,
            false_positive_rate: 0.01,
            retention_secs: 30 * 24 * 3600,
            prune_interval_secs: 3600,
        }
    }
}

impl DedupConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.expected_items == 0 {
            return Err(DedupError::InvalidConfig(
                "expected_items must be positive".to_string(),
            ));
        }
        if !(self.false_positive_rate > 0.0 && self.false_positive_rate < 1.0) {
            return Err(DedupError::InvalidConfig(
                "false_positive_rate must be in (0, 1)".to_string(),
            ));
        }
        if self.prune_interval_secs == 0 {
            return Err(DedupError::InvalidConfig(
                "prune_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Counters and filter health, for observability only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupStats {
    pub total_checks: u64,
    pub duplicates_detected: u64,
    pub new_messages: u64,
    /// "Maybe seen" answers the log proved wrong
    pub bloom_false_positives: u64,
    pub filter_items: u64,
    pub filter_fill_ratio: f64,
    pub estimated_false_positive_rate: f64,
    pub log_entries: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total_checks: AtomicU64,
    duplicates_detected: AtomicU64,
    new_messages: AtomicU64,
    bloom_false_positives: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.total_checks.store(0, Ordering::Relaxed);
        self.duplicates_detected.store(0, Ordering::Relaxed);
        self.new_messages.store(0, Ordering::Relaxed);
        self.bloom_false_positives.store(0, Ordering::Relaxed);
    }
}

struct Inner {
    config: DedupConfig,
    filter: RwLock<BloomFilter>,
    log: Arc<dyn DedupLog>,
    clock: Arc<dyn Clock>,
    /// Serializes check-and-mark so one caller wins per ID
    admission: Mutex<()>,
    counters: Counters,
}

impl Inner {
    fn fresh_filter(&self) -> Result<BloomFilter> {
        BloomFilter::new(self.config.expected_items, self.config.false_positive_rate)
    }

    async fn should_process(&self, message_id: &MessageId) -> Result<bool> {
        self.counters.total_checks.fetch_add(1, Ordering::Relaxed);

        if !self.filter.read().await.might_contain(message_id) {
            self.counters.new_messages.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }

        if self.log.has(message_id).await? {
            self.counters
                .duplicates_detected
                .fetch_add(1, Ordering::Relaxed);
            debug!("Duplicate message {}", message_id);
            return Ok(false);
        }

        self.counters
            .bloom_false_positives
            .fetch_add(1, Ordering::Relaxed);
        self.counters.new_messages.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn mark_seen(&self, message_id: &MessageId) -> Result<()> {
        // Log first: a rebuild that misses this entry still sees the add below
        self.log
            .save(LogEntry {
                message_id: *message_id,
                seen_at: self.clock.now_ms(),
            })
            .await?;
        self.filter.write().await.add(message_id);
        Ok(())
    }

    async fn rebuild_from_log(&self) -> Result<usize> {
        let mut filter = self.filter.write().await;
        let entries = self.log.get_all().await?;

        let mut rebuilt = self.fresh_filter()?;
        for entry in &entries {
            rebuilt.add(entry.message_id);
        }
        *filter = rebuilt;

        info!("Rebuilt dedup filter from {} log entries", entries.len());
        Ok(entries.len())
    }

    async fn prune_log(&self, max_age: Duration) -> Result<usize> {
        let cutoff = self
            .clock
            .now_ms()
            .saturating_sub(max_age.as_millis() as u64);
        let deleted = self.log.delete_older_than(cutoff).await?;

        if deleted > 0 {
            info!("Pruned {} dedup log entries", deleted);
        }

        let threshold = self.config.expected_items as f64 * REBUILD_PRUNE_FRACTION;
        if deleted as f64 > threshold {
            self.rebuild_from_log().await?;
        }

        Ok(deleted)
    }
}

/// Duplicate detection for inbound messages
pub struct DeduplicationManager {
    inner: Arc<Inner>,
    prune_task: Option<JoinHandle<()>>,
}

impl DeduplicationManager {
    pub fn new(
        config: DedupConfig,
        log: Arc<dyn DedupLog>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let filter = BloomFilter::new(config.expected_items, config.false_positive_rate)?;

        debug!(
            "Dedup filter sized at {} bits, {} hash rounds",
            filter.size(),
            filter.hash_count()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                filter: RwLock::new(filter),
                log,
                clock,
                admission: Mutex::new(()),
                counters: Counters::default(),
            }),
            prune_task: None,
        })
    }

    pub fn config(&self) -> &DedupConfig {
        &self.inner.config
    }

    /// True if the message has not been processed before
    pub async fn should_process(&self, message_id: &MessageId) -> Result<bool> {
        self.inner.should_process(message_id).await
    }

    pub async fn mark_seen(&self, message_id: &MessageId) -> Result<()> {
        self.inner.mark_seen(message_id).await
    }

    /// Check and record in one step; true for exactly one caller per ID
    pub async fn check_and_mark(&self, message_id: &MessageId) -> Result<bool> {
        let _admission = self.inner.admission.lock().await;

        let fresh = self.inner.should_process(message_id).await?;
        if fresh {
            self.inner.mark_seen(message_id).await?;
        }
        Ok(fresh)
    }

    /// Drop the log entry for a message that was marked but never kept.
    ///
    /// The filter bit stays set; the next check for this ID falls through to
    /// the log and admits it as a false positive.
    pub async fn forget(&self, message_id: &MessageId) -> Result<bool> {
        let _admission = self.inner.admission.lock().await;

        let removed = self.inner.log.remove(message_id).await?;
        if removed {
            debug!("Forgot message {}", message_id);
        }
        Ok(removed)
    }

    /// Replace the filter with one built from every log entry
    pub async fn rebuild_from_log(&self) -> Result<usize> {
        self.inner.rebuild_from_log().await
    }

    /// Delete log entries older than `max_age`, rebuilding after large prunes
    pub async fn prune_log(&self, max_age: Duration) -> Result<usize> {
        self.inner.prune_log(max_age).await
    }

    /// Start the recurring prune. No-op if already running.
    pub fn start(&mut self) {
        if self.prune_task.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let period = inner.config.prune_interval();
        let retention = inner.config.retention();

        self.prune_task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if let Err(e) = inner.prune_log(retention).await {
                    warn!("Dedup log prune failed: {}", e);
                }
            }
        }));
        debug!("Dedup prune task started (interval: {:?})", period);
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.prune_task.take() {
            task.abort();
            debug!("Dedup prune task stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.prune_task
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    pub async fn stats(&self) -> Result<DedupStats> {
        let counters = &self.inner.counters;
        let log_entries = self.inner.log.count().await?;
        let filter = self.inner.filter.read().await;

        Ok(DedupStats {
            total_checks: counters.total_checks.load(Ordering::Relaxed),
            duplicates_detected: counters.duplicates_detected.load(Ordering::Relaxed),
            new_messages: counters.new_messages.load(Ordering::Relaxed),
            bloom_false_positives: counters.bloom_false_positives.load(Ordering::Relaxed),
            filter_items: filter.item_count(),
            filter_fill_ratio: filter.fill_ratio(),
            estimated_false_positive_rate: filter.estimated_false_positive_rate(),
            log_entries,
        })
    }

    pub async fn export_filter(&self) -> BloomSnapshot {
        self.inner.filter.read().await.export()
    }

    /// Replace the live filter with a copy of `snapshot`
    pub async fn import_filter(&self, snapshot: BloomSnapshot) -> Result<()> {
        let imported = BloomFilter::import(snapshot)?;
        *self.inner.filter.write().await = imported;
        Ok(())
    }

    /// Forget everything: log, filter and counters
    pub async fn clear(&self) -> Result<()> {
        let mut filter = self.inner.filter.write().await;
        self.inner.log.clear().await?;
        *filter = self.inner.fresh_filter()?;
        self.inner.counters.reset();
        info!("Dedup state cleared");
        Ok(())
    }
}

impl Drop for DeduplicationManager {
    fn drop(&mut self) {
        if let Some(task) = self.prune_task.take() {
            task.abort();
        }
    }
}
