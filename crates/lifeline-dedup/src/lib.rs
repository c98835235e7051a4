//! Lifeline Deduplication Module
//!
//! Decides whether an inbound message has been seen before. A Bloom filter
//! answers the common "never seen" case without touching storage; a
//! persistent log keyed by message ID resolves the filter's false positives
//! and survives restarts.

pub mod bloom;
pub mod error;
pub mod log;
pub mod manager;
pub mod sqlite;

pub use bloom::{BloomFilter, BloomSnapshot};
pub use error::{DedupError, Result};
pub use log::{DedupLog, LogEntry, MemoryDedupLog};
pub use manager::{DedupConfig, DedupStats, DeduplicationManager};
pub use sqlite::SqliteDedupLog;
