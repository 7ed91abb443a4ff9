//! Fundamental types for the VEIL protocol.
//!
//! This crate defines the core types shared across every other crate in the
//! workspace: hashes, block identities and headers, chain work, height
//! ranges, confidential transactions, and timestamps.

pub mod block;
pub mod hash;
pub mod serde_array33;
pub mod time;
pub mod transaction;

pub use block::{BlockHeader, BlockId, ChainWork, Height, HeightRange};
pub use hash::{BbsMsgId, BlockHash, ContextHash, NodeId, TxFingerprint};
pub use time::Timestamp;
pub use transaction::{Transaction, TxKernel, TxOutput};
