//! Lifeline Core
//!
//! Wires the deduplication, storage, quota and geo routing subsystems into a
//! single store-and-forward relay node:
//!
//! ```text
//! inbound ──► dedup ──► wrap ──► ensure_room ──► store
//!                                                  │
//!          peers ──► geo scoring ◄── relay-eligible┘
//! ```
//!
//! Configuration is an explicit value handed to [`RelayNode::new`]; nothing is
//! held in process-wide state.

pub mod config;
pub mod error;
pub mod logging;
pub mod node;

pub use config::{Config, LoggingConfig, StorageBackend, StorageConfig};
pub use error::{CoreError, Result};
pub use logging::init_logging;
pub use node::{InboundOutcome, NodeStats, RelayNode};
