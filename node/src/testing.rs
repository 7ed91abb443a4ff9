//! Test doubles for the Processor boundary.
//!
//! [`TestProcessor`] is a scripted, in-memory chain engine with just enough
//! behavior to drive the orchestrator through sync, rollback, mempool and
//! mining flows deterministically. Production code never constructs it.

use std::collections::{BTreeMap, HashMap};

use sha2::{Digest, Sha256};

use veil_types::{
    BlockHeader, BlockId, ChainWork, ContextHash, Height, Timestamp, Transaction, TxFingerprint,
};

use crate::processor::{
    BlockTemplate, DataStatus, FastSyncWindow, Processor, ProcessorEvent, ProofQuery, TxStatus,
    TxValidation,
};

/// Build a structurally valid header chain of `len` blocks starting at
/// height 1.
pub fn make_chain(len: u64) -> Vec<BlockHeader> {
    make_chain_from(1, veil_types::BlockHash::ZERO, 0, len, 0)
}

/// Build `len` headers starting at `height` on top of `prev`, with a nonce
/// salt so alternative branches get distinct hashes.
pub fn make_chain_from(
    height: Height,
    prev: veil_types::BlockHash,
    prev_work: u128,
    len: u64,
    salt: u64,
) -> Vec<BlockHeader> {
    let mut headers = Vec::with_capacity(len as usize);
    let mut prev_hash = prev;
    let mut work = prev_work;
    for i in 0..len {
        let h = height + i;
        work += 10;
        let header = BlockHeader {
            height: h,
            prev: prev_hash,
            chain_work: ChainWork(work),
            timestamp: Timestamp::new(1_700_000_000 + h),
            pow_nonce: salt.wrapping_mul(1_000_003).wrapping_add(h),
        };
        prev_hash = header.hash();
        headers.push(header);
    }
    headers
}

/// Deterministic body bytes for a height.
pub fn make_body(height: Height) -> Vec<u8> {
    format!("body-{height}").into_bytes()
}

/// In-memory scripted Processor.
pub struct TestProcessor {
    headers: BTreeMap<Height, BlockHeader>,
    bodies: BTreeMap<Height, Vec<u8>>,
    /// Validated state head; advanced by body application.
    state_height: Option<Height>,
    fast_sync_done_emitted: bool,
    pub horizon: Height,
    pub hard_max_rollback: Height,
    pub fork_height: Height,
    /// Per-fingerprint validation overrides; default is `Accepted`.
    pub forced_tx_status: HashMap<TxFingerprint, TxStatus>,
}

impl TestProcessor {
    pub fn new(horizon: Height) -> Self {
        Self {
            headers: BTreeMap::new(),
            bodies: BTreeMap::new(),
            state_height: None,
            fast_sync_done_emitted: false,
            horizon,
            hard_max_rollback: 1440,
            fork_height: 0,
            forced_tx_status: HashMap::new(),
        }
    }

    /// A processor already synced over `len` blocks (headers, bodies, and
    /// state all at `len`).
    pub fn with_chain(len: u64, horizon: Height) -> Self {
        let mut p = Self::new(horizon);
        for header in make_chain(len) {
            let h = header.height;
            p.headers.insert(h, header);
            p.bodies.insert(h, make_body(h));
        }
        p.state_height = (len > 0).then_some(len);
        p
    }

    /// Replace the stored body at `height` (e.g. to simulate large blocks).
    pub fn set_body(&mut self, height: Height, body: Vec<u8>) {
        self.bodies.insert(height, body);
    }

    fn header_tip_height(&self) -> Option<Height> {
        self.headers.keys().next_back().copied()
    }

    fn id_at(&self, height: Height) -> Option<BlockId> {
        self.headers.get(&height).map(|h| h.id())
    }

    fn window_for_tip(&self, tip: Height) -> FastSyncWindow {
        FastSyncWindow {
            h0: (tip + 1).saturating_sub(self.horizon).max(1),
            h_txo_lo: (tip + 1).saturating_sub(self.horizon / 2).max(1),
        }
    }
}

impl Processor for TestProcessor {
    fn tip(&self) -> Option<BlockId> {
        self.state_height.and_then(|h| self.id_at(h))
    }

    fn tip_header(&self) -> Option<BlockHeader> {
        self.state_height.and_then(|h| self.headers.get(&h).cloned())
    }

    fn header_tip(&self) -> Option<BlockId> {
        self.header_tip_height().and_then(|h| self.id_at(h))
    }

    fn chain_work(&self) -> ChainWork {
        self.header_tip_height()
            .and_then(|h| self.headers.get(&h))
            .map(|h| h.chain_work)
            .unwrap_or(ChainWork::ZERO)
    }

    fn header_at(&self, height: Height) -> Option<BlockHeader> {
        self.headers.get(&height).cloned()
    }

    fn body_at(&self, height: Height) -> Option<Vec<u8>> {
        self.bodies.get(&height).cloned()
    }

    fn apply_headers(&mut self, headers: &[BlockHeader]) -> (DataStatus, Vec<ProcessorEvent>) {
        if headers.is_empty() {
            return (DataStatus::Rejected, vec![]);
        }
        if !crate::workers::check_header_chain(headers) {
            return (DataStatus::Invalid, vec![]);
        }
        let first = &headers[0];
        let attaches = match self.header_tip_height() {
            None => first.height == 1,
            Some(tip) => {
                first.height == tip + 1
                    && self.headers[&tip].hash() == first.prev
            }
        };
        if !attaches {
            // Duplicate delivery of already-known headers is harmless.
            let known = headers.iter().all(|h| {
                self.headers
                    .get(&h.height)
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
            self.headers.insert(header.height, header.clone());
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
        let Some(header) = self.headers.get(&id.height) else {
            return (DataStatus::Unreachable, vec![]);
        };
        if header.hash() != id.hash {
            return (DataStatus::Unreachable, vec![]);
        }
        if body == b"bad" {
            return (DataStatus::Invalid, vec![]);
        }
        if self.bodies.contains_key(&id.height) {
            return (DataStatus::Rejected, vec![]);
        }
        self.bodies.insert(id.height, body.to_vec());

        let mut events = Vec::new();
        let tip = self.header_tip_height().expect("headers nonempty");
        if fast_sync {
            let window = self.window_for_tip(tip);
            let complete = (window.h0..=tip).all(|h| self.bodies.contains_key(&h));
            if complete && !self.fast_sync_done_emitted {
                self.fast_sync_done_emitted = true;
                self.state_height = Some(tip);
                events.push(ProcessorEvent::NewState(self.id_at(tip).expect("tip id")));
                events.push(ProcessorEvent::FastSyncDone);
            }
        } else if self.state_height.map(|s| id.height > s).unwrap_or(true) {
            self.state_height = Some(id.height);
            events.push(ProcessorEvent::NewState(*id));
        }
        (DataStatus::Accepted, events)
    }

    fn rollback_to(&mut self, height: Height) -> Vec<ProcessorEvent> {
        self.headers.retain(|&h, _| h <= height);
        self.bodies.retain(|&h, _| h <= height);
        let mut events = Vec::new();
        if self.state_height.map(|s| s > height).unwrap_or(false) {
            self.state_height = (height > 0).then_some(height);
            if let Some(id) = self.id_at(height) {
                events.push(ProcessorEvent::RolledBack(id));
            }
        }
        events
    }

    fn hard_max_rollback(&self) -> Height {
        self.hard_max_rollback
    }

    fn fast_sync_window(&self, target: &BlockId) -> FastSyncWindow {
        self.window_for_tip(target.height)
    }

    fn fork_height(&self) -> Height {
        self.fork_height
    }

    fn validate_tx(&self, tx: &Transaction, parent: Option<&ContextHash>) -> TxValidation {
        let fp = tx.fingerprint();
        if let Some(&status) = self.forced_tx_status.get(&fp) {
            return TxValidation::rejected(status);
        }
        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.as_bytes());
        }
        hasher.update(fp.as_bytes());
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
                timestamp: Timestamp::new(tip.timestamp.as_secs() + 60),
                pow_nonce: 0,
            },
            body: make_body(tip.height + 1),
            fees,
        })
    }

    fn query(&self, q: &ProofQuery) -> Option<Vec<u8>> {
        match q {
            ProofQuery::ChainWork | ProofQuery::StateSummary => Some(vec![0xAA]),
            _ => None,
        }
    }
}
