//! Lifeline Protocol Module
//!
//! Shared vocabulary for the store-and-forward core: peer and message
//! identifiers, the opaque wire message the core hashes and sizes, and the
//! clock abstraction every time-dependent component is built on.

pub mod clock;
pub mod error;
pub mod message;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ProtocolError, Result};
pub use message::{MessageHeader, MessageId, MessageType, WireMessage};
pub use types::{PeerId, Timestamp};
