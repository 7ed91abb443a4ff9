//! Block identity, headers, chain work, and height ranges.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::hash::BlockHash;
use crate::time::Timestamp;

/// Block height. Genesis is height 0.
pub type Height = u64;

/// Height used to mean "unbounded" in ranges and confirm deadlines.
pub const MAX_HEIGHT: Height = u64::MAX;

/// A block's identity on the chain: `(height, hash)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId {
    pub height: Height,
    pub hash: BlockHash,
}

impl BlockId {
    pub fn new(height: Height, hash: BlockHash) -> Self {
        Self { height, hash }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.height, self.hash)
    }
}

/// Cumulative proof-of-work of a chain up to (and including) a block.
///
/// Tips are compared by chain work, never by height alone.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ChainWork(pub u128);

impl ChainWork {
    pub const ZERO: Self = Self(0);

    pub fn saturating_add(self, work: u64) -> Self {
        Self(self.0.saturating_add(work as u128))
    }
}

/// A block header as exchanged in header packs.
///
/// PoW verification itself belongs to the Processor; the orchestrator only
/// checks structural continuity (parent hashes, monotonic chain work).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: Height,
    pub prev: BlockHash,
    pub chain_work: ChainWork,
    pub timestamp: Timestamp,
    pub pow_nonce: u64,
}

impl BlockHeader {
    /// The header's own hash (identifies the block).
    pub fn hash(&self) -> BlockHash {
        let mut hasher = Sha256::new();
        hasher.update(self.height.to_le_bytes());
        hasher.update(self.prev.as_bytes());
        hasher.update(self.chain_work.0.to_le_bytes());
        hasher.update(self.timestamp.as_secs().to_le_bytes());
        hasher.update(self.pow_nonce.to_le_bytes());
        BlockHash::new(hasher.finalize().into())
    }

    pub fn id(&self) -> BlockId {
        BlockId::new(self.height, self.hash())
    }

    /// Whether `next` extends this header: consecutive height, matching
    /// parent hash, strictly increasing chain work.
    pub fn is_extended_by(&self, next: &BlockHeader) -> bool {
        next.height == self.height + 1
            && next.prev == self.hash()
            && next.chain_work > self.chain_work
    }
}

/// An inclusive height interval. `max == MAX_HEIGHT` means open-ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeightRange {
    pub min: Height,
    pub max: Height,
}

impl HeightRange {
    pub const OPEN: Self = Self {
        min: 0,
        max: MAX_HEIGHT,
    };

    pub fn new(min: Height, max: Height) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, h: Height) -> bool {
        self.min <= h && h <= self.max
    }

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    /// Intersection of two ranges. May be empty.
    pub fn intersect(&self, other: &HeightRange) -> HeightRange {
        HeightRange {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        }
    }
}

impl Default for HeightRange {
    fn default() -> Self {
        Self::OPEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(height: Height, prev: BlockHash, work: u128) -> BlockHeader {
        BlockHeader {
            height,
            prev,
            chain_work: ChainWork(work),
            timestamp: Timestamp::new(1_700_000_000 + height),
            pow_nonce: height * 31,
        }
    }

    #[test]
    fn header_hash_is_deterministic() {
        let h = header(5, BlockHash::new([1; 32]), 100);
        assert_eq!(h.hash(), h.hash());

        let mut h2 = h.clone();
        h2.pow_nonce += 1;
        assert_ne!(h.hash(), h2.hash());
    }

    #[test]
    fn extension_requires_parent_and_work() {
        let a = header(10, BlockHash::ZERO, 100);
        let good = header(11, a.hash(), 110);
        assert!(a.is_extended_by(&good));

        let wrong_parent = header(11, BlockHash::new([9; 32]), 110);
        assert!(!a.is_extended_by(&wrong_parent));

        let no_new_work = header(11, a.hash(), 100);
        assert!(!a.is_extended_by(&no_new_work));

        let skipped = header(12, a.hash(), 120);
        assert!(!a.is_extended_by(&skipped));
    }

    #[test]
    fn height_range_intersection() {
        let a = HeightRange::new(10, 50);
        let b = HeightRange::new(40, 90);
        assert_eq!(a.intersect(&b), HeightRange::new(40, 50));

        let disjoint = HeightRange::new(60, 70);
        assert!(a.intersect(&disjoint).is_empty());
    }

    #[test]
    fn open_range_contains_everything() {
        assert!(HeightRange::OPEN.contains(0));
        assert!(HeightRange::OPEN.contains(MAX_HEIGHT));
    }
}
