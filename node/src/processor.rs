//! The Processor boundary.
//!
//! Block/transaction validation and the UTXO/contract state engine are
//! external collaborators. The orchestrator drives them through this trait
//! and observes tip changes only through the [`ProcessorEvent`]s returned
//! by the mutating calls, in the order they are returned.

use veil_types::{
    BlockHeader, BlockId, ChainWork, ContextHash, Height, Transaction,
};

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

/// Outcome of transaction validation / pool admission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Accepted,
    AlreadyKnown,
    Invalid,
    DoubleSpend,
    TooLowFee,
    HeightOutOfRange,
    /// Dependent transaction referenced an unknown parent context.
    ContextMismatch,
}

impl TxStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, TxStatus::Accepted | TxStatus::AlreadyKnown)
    }
}

/// Outcome of handing a header pack or block body to the Processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataStatus {
    /// Applied; may have advanced the tip.
    Accepted,
    /// Well-formed but already known — no state change.
    Rejected,
    /// Failed validation. The delivering peer misbehaved.
    Invalid,
    /// Cannot be attached to any known state.
    Unreachable,
}

/// Result of validating a transaction in some context.
#[derive(Clone, Debug)]
pub struct TxValidation {
    pub status: TxStatus,
    /// Fee left over after covering the minimum; funds dummy outputs.
    pub fee_reserve: u64,
    /// For dependent validation: the context produced on top of the parent.
    pub new_context: Option<ContextHash>,
}

impl TxValidation {
    pub fn rejected(status: TxStatus) -> Self {
        Self {
            status,
            fee_reserve: 0,
            new_context: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// State transitions reported by the Processor. The orchestrator observes
/// these in the order returned, per chain, monotonically.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessorEvent {
    /// The tip advanced to this block.
    NewState(BlockId),
    /// The chain was rolled back; the id is the new (lower) tip.
    RolledBack(BlockId),
    /// Fast-sync body application completed up to the target.
    FastSyncDone,
}

/// The body-fetch window during fast sync: bodies in `[h0, h_txo_lo]` may
/// be applied without full verification, relying on checkpointed state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FastSyncWindow {
    pub h0: Height,
    pub h_txo_lo: Height,
}

// ---------------------------------------------------------------------------
// Proof / query service
// ---------------------------------------------------------------------------

/// Opaque queries served by the Processor on behalf of peers. The
/// orchestrator forwards the reply bytes without interpreting them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProofQuery {
    State { height: Height },
    ChainWork,
    Kernel { kernel_id: [u8; 32] },
    Kernel2 { kernel_id: [u8; 32], fetch_kernel: bool },
    Utxo { commitment: [u8; 33] },
    ShieldedOutp { serial: [u8; 32] },
    ShieldedInp { serial: [u8; 32] },
    Asset { asset_id: u32 },
    ShieldedList { id0: u64, count: u32 },
    ShieldedOutputsAt { height: Height },
    Events { height_from: Height },
    StateSummary,
    ContractVars { key_min: Vec<u8>, key_max: Vec<u8> },
    ContractLogs { key_min: Vec<u8>, key_max: Vec<u8>, pos_min: u64, pos_max: u64 },
    ContractVar { key: Vec<u8> },
    ContractLogProof { pos: u64 },
}

// ---------------------------------------------------------------------------
// Mining template
// ---------------------------------------------------------------------------

/// An assembled block candidate handed to the miner.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockTemplate {
    /// Header with everything filled in except the winning nonce.
    pub header: BlockHeader,
    /// Serialized body to publish alongside the solved header.
    pub body: Vec<u8>,
    pub fees: u64,
}

// ---------------------------------------------------------------------------
// The trait
// ---------------------------------------------------------------------------

/// The validated chain state engine, as seen by the orchestrator.
pub trait Processor {
    /// Current validated tip: the head whose state the Processor accepts.
    /// Changes are reported through [`ProcessorEvent::NewState`] /
    /// [`ProcessorEvent::RolledBack`].
    fn tip(&self) -> Option<BlockId>;

    /// Header of the validated tip.
    fn tip_header(&self) -> Option<BlockHeader>;

    /// Highest header accepted so far. During header sync this runs ahead
    /// of [`Processor::tip`].
    fn header_tip(&self) -> Option<BlockId>;

    /// Cumulative work of the current chain.
    fn chain_work(&self) -> ChainWork;

    /// Header at `height` on the current branch.
    fn header_at(&self, height: Height) -> Option<BlockHeader>;

    /// Stored body at `height`, for serving peers.
    fn body_at(&self, height: Height) -> Option<Vec<u8>>;

    /// Validate and apply a contiguous ascending run of headers. On
    /// `Accepted` the returned events describe any tip movement.
    fn apply_headers(&mut self, headers: &[BlockHeader]) -> (DataStatus, Vec<ProcessorEvent>);

    /// Validate and apply a block body for an already-known header.
    fn apply_body(
        &mut self,
        id: &BlockId,
        body: &[u8],
        fast_sync: bool,
    ) -> (DataStatus, Vec<ProcessorEvent>);

    /// Roll the chain back so `height` is the new tip.
    fn rollback_to(&mut self, height: Height) -> Vec<ProcessorEvent>;

    /// Consensus-rule hard cap on rollback depth. The configured
    /// `max_auto` never exceeds this.
    fn hard_max_rollback(&self) -> Height;

    /// The fast-sync window for a sync targeting `target`, derived from
    /// the configured horizon.
    fn fast_sync_window(&self, target: &BlockId) -> FastSyncWindow;

    /// Height of the newest consensus fork these rules understand. Used to
    /// check a peer's declared `min_peer_fork`.
    fn fork_height(&self) -> Height;

    /// Full validation of a transaction, optionally on top of a dependent
    /// parent context.
    fn validate_tx(&self, tx: &Transaction, parent: Option<&ContextHash>) -> TxValidation;

    /// Assemble a block candidate from the given pool transactions.
    fn build_template(&self, txs: &[&Transaction]) -> Option<BlockTemplate>;

    /// Serve an opaque proof/query request; `None` becomes `DataMissing`.
    fn query(&self, q: &ProofQuery) -> Option<Vec<u8>>;
}
