//! Byte-budget enforcement for a message store
//!
//! Status is a pure function of `used / max`:
//!
//! | usage                    | status   |
//! |--------------------------|----------|
//! | below warning threshold  | OK       |
//! | below critical threshold | WARNING  |
//! | below 1.0                | CRITICAL |
//! | 1.0 and above            | FULL     |
//!
//! Usage is recomputed from the store on every call. The only cached state is
//! the last status reported to warning callbacks, so each transition is
//! reported once.

use lifeline_protocol::{Clock, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::error::{Result, StoreError};
use crate::eviction::EvictionResult;
use crate::store::MessageStore;

/// Quota configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub max_bytes: u64,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    /// Usage ratio periodic eviction brings the store down to
    pub eviction_target: f64,
    pub check_interval_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_bytes: 50 * 1024 * 1024,
            warning_threshold: 0.8,
            critical_threshold: 0.95,
            eviction_target: 0.7,
            check_interval_secs: 60,
        }
    }
}

impl QuotaConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_bytes == 0 {
            return Err(StoreError::InvalidConfig("max_bytes must be positive".to_string()));
        }
        if !(0.0 < self.warning_threshold
            && self.warning_threshold < self.critical_threshold
            && self.critical_threshold <= 1.0)
        {
            return Err(StoreError::InvalidConfig(format!(
                "thresholds must satisfy 0 < warning ({}) < critical ({}) <= 1",
                self.warning_threshold, self.critical_threshold
            )));
        }
        if !(0.0..self.critical_threshold).contains(&self.eviction_target) {
            return Err(StoreError::InvalidConfig(format!(
                "eviction_target {} must be below the critical threshold",
                self.eviction_target
            )));
        }
        if self.check_interval_secs == 0 {
            return Err(StoreError::InvalidConfig(
                "check_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Storage pressure level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QuotaStatus {
    Ok,
    Warning,
    Critical,
    Full,
}

impl QuotaStatus {
    pub fn from_usage(used_bytes: u64, config: &QuotaConfig) -> Self {
        if used_bytes >= config.max_bytes {
            return QuotaStatus::Full;
        }

        let ratio = used_bytes as f64 / config.max_bytes as f64;
        if ratio >= config.critical_threshold {
            QuotaStatus::Critical
        } else if ratio >= config.warning_threshold {
            QuotaStatus::Warning
        } else {
            QuotaStatus::Ok
        }
    }

    /// Whether periodic maintenance should evict
    pub fn needs_eviction(&self) -> bool {
        *self >= QuotaStatus::Critical
    }
}

impl fmt::Display for QuotaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QuotaStatus::Ok => "OK",
            QuotaStatus::Warning => "WARNING",
            QuotaStatus::Critical => "CRITICAL",
            QuotaStatus::Full => "FULL",
        };
        f.write_str(s)
    }
}

/// Point-in-time quota snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaInfo {
    pub status: QuotaStatus,
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub available_bytes: u64,
    pub usage_ratio: f64,
    pub message_count: usize,
    pub oldest_message: Option<Timestamp>,
}

/// Called with the new snapshot whenever the status changes
pub type QuotaCallback = Arc<dyn Fn(&QuotaInfo) + Send + Sync>;

struct Inner {
    config: QuotaConfig,
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    last_status: Mutex<QuotaStatus>,
    callbacks: RwLock<Vec<QuotaCallback>>,
}

impl Inner {
    async fn quota_info(&self) -> Result<QuotaInfo> {
        let stats = self.store.get_stats().await?;
        let used = stats.total_bytes;
        let max = self.config.max_bytes;

        Ok(QuotaInfo {
            status: QuotaStatus::from_usage(used, &self.config),
            used_bytes: used,
            max_bytes: max,
            available_bytes: max.saturating_sub(used),
            usage_ratio: used as f64 / max as f64,
            message_count: stats.total_messages,
            oldest_message: stats.oldest_message,
        })
    }

    async fn evict(&self, bytes_to_free: u64, reason: &str) -> Result<EvictionResult> {
        let result = self.store.evict_by_priority(bytes_to_free).await?;

        if result.bytes_freed < bytes_to_free {
            warn!(
                "Eviction ({}) freed {} of {} bytes; remaining messages are protected",
                reason, result.bytes_freed, bytes_to_free
            );
        } else {
            info!(
                "Eviction ({}) removed {} messages, {} bytes",
                reason, result.messages_evicted, result.bytes_freed
            );
        }
        Ok(result)
    }

    /// Notify callbacks if the status changed since the last report
    async fn refresh_status(&self) -> Result<QuotaInfo> {
        let info = self.quota_info().await?;

        let changed = {
            let mut last = self
                .last_status
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let changed = *last != info.status;
            *last = info.status;
            changed
        };

        if changed {
            info!(
                "Quota status now {} ({}/{} bytes)",
                info.status, info.used_bytes, info.max_bytes
            );
            self.notify(&info);
        }
        Ok(info)
    }

    fn notify(&self, info: &QuotaInfo) {
        let callbacks: Vec<QuotaCallback> = self
            .callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(info))).is_err() {
                error!("Quota warning callback panicked");
            }
        }
    }

    async fn check_and_evict(&self) -> Result<Option<EvictionResult>> {
        let pruned = self.store.prune_expired(self.clock.now_ms()).await?;
        if pruned > 0 {
            debug!("Pruned {} expired messages", pruned);
        }

        let info = self.refresh_status().await?;
        if !info.status.needs_eviction() {
            return Ok(None);
        }

        let target = (self.config.max_bytes as f64 * self.config.eviction_target) as u64;
        let to_free = info.used_bytes.saturating_sub(target);
        let result = self.evict(to_free, "threshold").await?;

        self.refresh_status().await?;
        Ok(Some(result))
    }
}

fn fits(info: &QuotaInfo, bytes: u64) -> bool {
    info.used_bytes
        .checked_add(bytes)
        .map_or(false, |total| total <= info.max_bytes)
}

/// Keeps a [`MessageStore`] under its byte budget
pub struct QuotaManager {
    inner: Arc<Inner>,
    check_task: Option<JoinHandle<()>>,
}

impl QuotaManager {
    pub fn new(
        config: QuotaConfig,
        store: Arc<dyn MessageStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                clock,
                last_status: Mutex::new(QuotaStatus::Ok),
                callbacks: RwLock::new(Vec::new()),
            }),
            check_task: None,
        })
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.inner.config
    }

    pub async fn get_status(&self) -> Result<QuotaStatus> {
        Ok(self.inner.quota_info().await?.status)
    }

    pub async fn get_quota_info(&self) -> Result<QuotaInfo> {
        self.inner.quota_info().await
    }

    /// True iff `bytes` more would still fit
    pub async fn can_accept(&self, bytes: u64) -> Result<bool> {
        let info = self.inner.quota_info().await?;
        Ok(fits(&info, bytes))
    }

    /// Evict as needed so `bytes` more fit; false if protected messages prevent it
    pub async fn ensure_room(&self, bytes: u64) -> Result<bool> {
        let info = self.inner.quota_info().await?;
        if fits(&info, bytes) {
            return Ok(true);
        }
        if bytes > info.max_bytes {
            debug!("Request of {} bytes exceeds the whole quota", bytes);
            return Ok(false);
        }

        let needed = info.used_bytes.saturating_add(bytes) - info.max_bytes;
        self.inner.evict(needed, "quota").await?;

        let info = self.inner.refresh_status().await?;
        Ok(fits(&info, bytes))
    }

    pub async fn evict(&self, bytes_to_free: u64, reason: &str) -> Result<EvictionResult> {
        let result = self.inner.evict(bytes_to_free, reason).await?;
        self.inner.refresh_status().await?;
        Ok(result)
    }

    /// Prune expired messages, then evict down to the target if critical
    ///
    /// Returns `None` when no eviction was needed.
    pub async fn check_and_evict(&self) -> Result<Option<EvictionResult>> {
        self.inner.check_and_evict().await
    }

    pub fn on_quota_warning<F>(&self, callback: F)
    where
        F: Fn(&QuotaInfo) + Send + Sync + 'static,
    {
        self.inner
            .callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(callback));
    }

    /// Run a check now and then every interval. No-op if already running.
    pub fn start(&mut self) {
        if self.check_task.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let period = inner.config.check_interval();

        self.check_task = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = inner.check_and_evict().await {
                    warn!("Quota check failed: {}", e);
                }
            }
        }));
        debug!("Quota check task started (interval: {:?})", period);
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.check_task.take() {
            task.abort();
            debug!("Quota check task stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.check_task
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }
}

impl Drop for QuotaManager {
    fn drop(&mut self) {
        if let Some(task) = self.check_task.take() {
            task.abort();
        }
    }
}
