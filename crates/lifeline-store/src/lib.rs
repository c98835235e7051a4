//! Lifeline Message Store Module
//!
//! The stored-message model (priority, TTL, status, relay bookkeeping), the
//! [`MessageStore`] contract every backend implements, the shared eviction
//! order, and the [`QuotaManager`] that keeps a store under its byte budget.
//!
//! Two backends ship with the crate: [`MemoryMessageStore`] and the
//! SQLite-backed [`SqliteMessageStore`].

pub mod error;
pub mod eviction;
pub mod memory;
pub mod message;
pub mod quota;
pub mod sqlite;
pub mod store;

pub use error::{Result, StoreError};
pub use eviction::{EvictionCandidate, EvictionResult};
pub use memory::MemoryMessageStore;
pub use message::{
    calculate_message_size, create_stored_message, MessagePriority, MessageStatus,
    StoreOptions, StoredMessage, METADATA_OVERHEAD,
};
pub use quota::{QuotaCallback, QuotaConfig, QuotaInfo, QuotaManager, QuotaStatus};
pub use sqlite::SqliteMessageStore;
pub use store::{MessageQuery, MessageStore, StoreStats};
