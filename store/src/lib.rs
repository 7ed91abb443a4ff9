//! Narrow persistence interfaces.
//!
//! The actual key/value engine backing a production node is an external
//! collaborator; the orchestrator only sees these traits. The in-memory
//! implementation backs tests and the default daemon wiring.

pub mod bbs;
pub mod chain;
pub mod error;
pub mod memory;
pub mod peer;

pub use bbs::{BbsRecord, BbsStore, BbsTotals};
pub use chain::ChainStore;
pub use error::StoreError;
pub use memory::MemoryStore;
pub use peer::PeerStore;
