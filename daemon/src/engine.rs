//! Dev-mode chain engine.
//!
//! A production deployment links the real validator/state engine behind
//! the `Processor` trait. Dev mode ships this minimal engine instead: it
//! keeps structural chain rules (continuity, chain work) over the
//! in-memory store, accepts every transaction, and serves no proofs.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use veil_node::processor::{
    BlockTemplate, DataStatus, FastSyncWindow, Processor, ProcessorEvent, ProofQuery, TxStatus,
    TxValidation,
};
use veil_node::workers::check_header_chain;
use veil_store::{ChainStore, MemoryStore};
use veil_types::{
    BlockHeader, BlockId, ChainWork, ContextHash, Height, Timestamp, Transaction,
};

pub struct DevEngine {
    store: Arc<MemoryStore>,
    horizon: Height,
    state_height: Option<Height>,
    fast_sync_done_emitted: bool,
}

impl DevEngine {
    pub fn new(store: Arc<MemoryStore>, horizon: Height) -> Self {
        let state_height = store
            .tip()
            .ok()
            .flatten()
            .map(|id| id.height);
        Self {
            store,
            horizon,
            state_height,
            fast_sync_done_emitted: false,
        }
    }

    fn header_tip_height(&self) -> Option<Height> {
        self.store.tip().ok().flatten().map(|id| id.height)
    }

    fn id_at(&self, height: Height) -> Option<BlockId> {
        self.store.header_at(height).ok().flatten().map(|h| h.id())
    }

    fn window_for(&self, tip: Height) -> FastSyncWindow {
        FastSyncWindow {
            h0: (tip + 1).saturating_sub(self.horizon).max(1),
            h_txo_lo: (tip + 1).saturating_sub(self.horizon / 2).max(1),
        }
    }
}

impl Processor for DevEngine {
    fn tip(&self) -> Option<BlockId> {
        self.state_height.and_then(|h| self.id_at(h))
    }

    fn tip_header(&self) -> Option<BlockHeader> {
        self.state_height
            .and_then(|h| self.store.header_at(h).ok().flatten())
    }

    fn header_tip(&self) -> Option<BlockId> {
        self.header_tip_height().and_then(|h| self.id_at(h))
    }

    fn chain_work(&self) -> ChainWork {
        self.header_tip_height()
            .and_then(|h| self.store.header_at(h).ok().flatten())
            .map(|h| h.chain_work)
            .unwrap_or(ChainWork::ZERO)
    }

    fn header_at(&self, height: Height) -> Option<BlockHeader> {
        self.store.header_at(height).ok().flatten()
    }

    fn body_at(&self, height: Height) -> Option<Vec<u8>> {
        self.store.body_at(height).ok().flatten()
    }

    fn apply_headers(&mut self, headers: &[BlockHeader]) -> (DataStatus, Vec<ProcessorEvent>) {
        if headers.is_empty() {
            return (DataStatus::Rejected, vec![]);
        }
        if !check_header_chain(headers) {
            return (DataStatus::Invalid, vec![]);
        }
        let first = &headers[0];
        let attaches = match self.header_tip_height() {
            None => first.height == 1,
            Some(tip) => {
                first.height == tip + 1
                    && self
                        .header_at(tip)
                        .map(|h| h.hash() == first.prev)
                        .unwrap_or(false)
            }
        };
        if !attaches {
            let known = headers.iter().all(|h| {
                self.header_at(h.height)
                    .map(|mine| mine.hash() == h.hash())
                    .unwrap_or(false)
            });
            return if known {
                (DataStatus::Rejected, vec![])
            } else {
                (DataStatus::Unreachable, vec![])
            };
        }
        for header in headers {
            if self.store.save_block(header, None).is_err() {
                return (DataStatus::Unreachable, vec![]);
            }
        }
        self.fast_sync_done_emitted = false;
        (DataStatus::Accepted, vec![])
    }

    fn apply_body(
        &mut self,
        id: &BlockId,
        body: &[u8],
        fast_sync: bool,
    ) -> (DataStatus, Vec<ProcessorEvent>) {
        let Some(header) = self.header_at(id.height) else {
            return (DataStatus::Unreachable, vec![]);
        };
        if header.hash() != id.hash {
            return (DataStatus::Unreachable, vec![]);
        }
        if self.body_at(id.height).is_some() {
            return (DataStatus::Rejected, vec![]);
        }
        if self.store.save_block(&header, Some(body)).is_err() {
            return (DataStatus::Unreachable, vec![]);
        }

        let mut events = Vec::new();
        let tip = self.header_tip_height().expect("headers nonempty");
        if fast_sync {
            let window = self.window_for(tip);
            let complete = (window.h0..=tip).all(|h| self.body_at(h).is_some());
            if complete && !self.fast_sync_done_emitted {
                self.fast_sync_done_emitted = true;
                self.state_height = Some(tip);
                if let Some(id) = self.id_at(tip) {
                    events.push(ProcessorEvent::NewState(id));
                }
                events.push(ProcessorEvent::FastSyncDone);
            }
        } else if self.state_height.map(|s| id.height > s).unwrap_or(true) {
            self.state_height = Some(id.height);
            events.push(ProcessorEvent::NewState(*id));
        }
        (DataStatus::Accepted, events)
    }

    fn rollback_to(&mut self, height: Height) -> Vec<ProcessorEvent> {
        let mut events = Vec::new();
        if self.store.rollback_to(height).is_err() {
            return events;
        }
        if self.state_height.map(|s| s > height).unwrap_or(false) {
            self.state_height = (height > 0).then_some(height);
            if let Some(id) = self.id_at(height) {
                events.push(ProcessorEvent::RolledBack(id));
            }
        }
        events
    }

    fn hard_max_rollback(&self) -> Height {
        1440
    }

    fn fast_sync_window(&self, target: &BlockId) -> FastSyncWindow {
        self.window_for(target.height)
    }

    fn fork_height(&self) -> Height {
        0
    }

    fn validate_tx(&self, tx: &Transaction, parent: Option<&ContextHash>) -> TxValidation {
        // Dev mode: structurally sane transactions pass.
        if tx.kernels.is_empty() {
            return TxValidation::rejected(TxStatus::Invalid);
        }
        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.as_bytes());
        }
        hasher.update(tx.fingerprint().as_bytes());
        TxValidation {
            status: TxStatus::Accepted,
            fee_reserve: tx.fee() / 2,
            new_context: Some(ContextHash::new(hasher.finalize().into())),
        }
    }

    fn build_template(&self, txs: &[&Transaction]) -> Option<BlockTemplate> {
        let tip = self.tip_header()?;
        let fees: u64 = txs.iter().map(|t| t.fee()).sum();
        Some(BlockTemplate {
            header: BlockHeader {
                height: tip.height + 1,
                prev: tip.hash(),
                chain_work: ChainWork(tip.chain_work.0 + 10),
                timestamp: Timestamp::now(),
                pow_nonce: 0,
            },
            body: Vec::new(),
            fees,
        })
    }

    fn query(&self, _q: &ProofQuery) -> Option<Vec<u8>> {
        None
    }
}
