//! Chain state storage trait.

use veil_types::{BlockHeader, BlockId, Height};

use crate::StoreError;

/// Persistent chain state as seen by the orchestrator.
///
/// The Processor is the only writer during normal operation; the node reads
/// back headers when serving peers.
pub trait ChainStore {
    /// The current tip, if any block beyond genesis is stored.
    fn tip(&self) -> Result<Option<BlockId>, StoreError>;

    /// Persist a header (and optionally the block body) at its height.
    fn save_block(
        &self,
        header: &BlockHeader,
        body: Option<&[u8]>,
    ) -> Result<(), StoreError>;

    /// Header stored at `height` on the current branch.
    fn header_at(&self, height: Height) -> Result<Option<BlockHeader>, StoreError>;

    /// Body stored at `height`, if it was ever downloaded.
    fn body_at(&self, height: Height) -> Result<Option<Vec<u8>>, StoreError>;

    /// Drop all blocks strictly above `height`.
    fn rollback_to(&self, height: Height) -> Result<(), StoreError>;

    /// Block ids in `[min, max]`, ascending.
    fn enumerate(&self, min: Height, max: Height) -> Result<Vec<BlockId>, StoreError>;
}
