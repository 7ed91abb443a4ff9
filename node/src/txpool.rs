//! Transaction pools: fluff (broadcast), stem (dandelion), dependent.
//!
//! The fluff pool is the mempool proper: validated transactions indexed by
//! fingerprint with a fee-rate order for eviction and block templating.
//! The stem pool holds transactions still in the dandelion stem phase;
//! each entry either forwards to one chosen peer or transitions to fluff
//! exactly once (timer, aggregation, forced confirm, or relay-peer loss —
//! the transition itself is driven by the reactor). The dependent pool
//! tracks chains of unmined contexts built on the current tip and resets
//! whenever the tip advances.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use veil_types::{ContextHash, Height, HeightRange, Transaction, TxFingerprint};

use crate::peer::PeerId;

// ---------------------------------------------------------------------------
// Fluff pool
// ---------------------------------------------------------------------------

/// A transaction admitted to the broadcast pool.
#[derive(Clone, Debug)]
pub struct FluffEntry {
    pub tx: Transaction,
    pub context: Option<ContextHash>,
    pub arrived_at_ms: u64,
    pub weight: usize,
    pub fee: u64,
    pub fee_rate: u64,
    pub height_range: HeightRange,
    /// Admission sequence; drives announcement cursors and eviction
    /// tie-breaks.
    pub seq: u64,
}

/// Outcome of a fluff-pool insert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FluffInsert {
    /// Admitted; the listed entries were evicted to make room.
    Inserted { evicted: Vec<TxFingerprint> },
    /// Already present; the pool is unchanged.
    Duplicate,
    /// Pool at capacity and this fee rate does not beat the current
    /// minimum; rejected without evicting anything.
    BelowMinimum,
}

/// Bounded mempool with a fee-rate eviction order.
///
/// Eviction removes the lowest fee rate first; among equal rates the most
/// recently arrived entry goes first, so long-standing (already relayed)
/// transactions are not displaced by equal-fee newcomers.
pub struct FluffPool {
    entries: HashMap<TxFingerprint, FluffEntry>,
    /// (fee_rate, Reverse(seq), fp) — iteration order is eviction order.
    by_fee_rate: BTreeSet<(u64, Reverse<u64>, TxFingerprint)>,
    by_seq: BTreeMap<u64, TxFingerprint>,
    total_weight: usize,
    max_count: usize,
    max_weight: usize,
    next_seq: u64,
}

impl FluffPool {
    pub fn new(max_count: usize, max_weight: usize) -> Self {
        Self {
            entries: HashMap::new(),
            by_fee_rate: BTreeSet::new(),
            by_seq: BTreeMap::new(),
            total_weight: 0,
            max_count,
            max_weight,
            // Sequence numbers start at 1 so a cursor of 0 means "nothing
            // seen yet".
            next_seq: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_weight(&self) -> usize {
        self.total_weight
    }

    pub fn contains(&self, fp: &TxFingerprint) -> bool {
        self.entries.contains_key(fp)
    }

    pub fn get(&self, fp: &TxFingerprint) -> Option<&FluffEntry> {
        self.entries.get(fp)
    }

    /// The lowest fee rate currently in the pool.
    pub fn min_fee_rate(&self) -> Option<u64> {
        self.by_fee_rate.iter().next().map(|(rate, _, _)| *rate)
    }

    fn at_capacity_with(&self, extra_weight: usize) -> bool {
        self.entries.len() >= self.max_count
            || self.total_weight + extra_weight > self.max_weight
    }

    /// Admit a validated transaction.
    pub fn insert(
        &mut self,
        tx: Transaction,
        context: Option<ContextHash>,
        now_ms: u64,
    ) -> FluffInsert {
        let fp = tx.fingerprint();
        if self.entries.contains_key(&fp) {
            return FluffInsert::Duplicate;
        }
        let weight = tx.weight();
        let fee_rate = tx.fee_rate();

        let mut evicted = Vec::new();
        if self.at_capacity_with(weight) {
            if weight > self.max_weight {
                return FluffInsert::BelowMinimum;
            }
            match self.min_fee_rate() {
                Some(min) if fee_rate < min => return FluffInsert::BelowMinimum,
                None => return FluffInsert::BelowMinimum,
                _ => {}
            }
            while self.at_capacity_with(weight) {
                let Some(&victim) = self.by_fee_rate.iter().next() else {
                    return FluffInsert::BelowMinimum;
                };
                self.remove(&victim.2);
                evicted.push(victim.2);
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = FluffEntry {
            height_range: tx.height_range(),
            fee: tx.fee(),
            fee_rate,
            weight,
            arrived_at_ms: now_ms,
            context,
            seq,
            tx,
        };
        self.total_weight += weight;
        self.by_fee_rate.insert((fee_rate, Reverse(seq), fp));
        self.by_seq.insert(seq, fp);
        self.entries.insert(fp, entry);
        FluffInsert::Inserted { evicted }
    }

    /// Remove an entry (mined, outdated, or evicted).
    pub fn remove(&mut self, fp: &TxFingerprint) -> Option<FluffEntry> {
        let entry = self.entries.remove(fp)?;
        self.by_fee_rate
            .remove(&(entry.fee_rate, Reverse(entry.seq), *fp));
        self.by_seq.remove(&entry.seq);
        self.total_weight -= entry.weight;
        Some(entry)
    }

    /// Entries admitted after `cursor`, in admission order. Drives the
    /// per-peer `HaveTransaction` announcement stream.
    pub fn announced_after(&self, cursor: u64) -> Vec<(u64, TxFingerprint)> {
        self.by_seq
            .range(cursor.saturating_add(1)..)
            .map(|(&seq, &fp)| (seq, fp))
            .collect()
    }

    /// The most recent admission sequence number.
    pub fn latest_seq(&self) -> u64 {
        self.next_seq.saturating_sub(1)
    }

    /// Highest-fee-rate entries first, up to `max_weight` total, for block
    /// templating.
    pub fn select_for_template(&self, max_weight: usize) -> Vec<&FluffEntry> {
        let mut picked = Vec::new();
        let mut weight = 0usize;
        for (_, _, fp) in self.by_fee_rate.iter().rev() {
            let entry = &self.entries[fp];
            if weight + entry.weight > max_weight {
                continue;
            }
            weight += entry.weight;
            picked.push(entry);
        }
        picked
    }

    /// Drop entries that can no longer be mined (their height range ended
    /// below the next block height). Returns what was removed.
    pub fn drop_expired(&mut self, next_height: Height) -> Vec<TxFingerprint> {
        let stale: Vec<TxFingerprint> = self
            .entries
            .iter()
            .filter(|(_, e)| e.height_range.max < next_height)
            .map(|(fp, _)| *fp)
            .collect();
        for fp in &stale {
            self.remove(fp);
        }
        stale
    }
}

// ---------------------------------------------------------------------------
// Stem pool
// ---------------------------------------------------------------------------

/// A transaction in the dandelion stem phase.
#[derive(Clone, Debug)]
pub struct StemEntry {
    pub tx: Transaction,
    pub context: Option<ContextHash>,
    /// The single downstream peer this stem forwards to.
    pub relay_peer: Option<PeerId>,
    /// Stem timer: fluff when it fires.
    pub timeout_at_ms: u64,
    /// While aggregating, the entry also fluffs when this earlier deadline
    /// fires with at least one merge partner accumulated.
    pub aggregation_deadline_ms: Option<u64>,
    /// Still collecting merge partners (not yet forwarded).
    pub aggregating: bool,
    /// Fee available to fund dummy outputs.
    pub fee_reserve: u64,
    /// Forced-fluff height: if the tip reaches this without the tx being
    /// mined, it fluffs.
    pub confirm_deadline: Option<Height>,
}

impl StemEntry {
    fn effective_deadline(&self) -> u64 {
        match (self.aggregating, self.aggregation_deadline_ms) {
            (true, Some(agg)) => agg.min(self.timeout_at_ms),
            _ => self.timeout_at_ms,
        }
    }
}

/// The stem-phase pool, indexed by fingerprint with a deadline order.
pub struct StemPool {
    entries: HashMap<TxFingerprint, StemEntry>,
    by_deadline: BTreeSet<(u64, TxFingerprint)>,
}

impl StemPool {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            by_deadline: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, fp: &TxFingerprint) -> bool {
        self.entries.contains_key(fp)
    }

    pub fn get(&self, fp: &TxFingerprint) -> Option<&StemEntry> {
        self.entries.get(fp)
    }

    /// Insert or replace an entry. Replacement re-indexes the deadline.
    pub fn insert(&mut self, fp: TxFingerprint, entry: StemEntry) {
        if let Some(old) = self.entries.remove(&fp) {
            self.by_deadline.remove(&(old.effective_deadline(), fp));
        }
        self.by_deadline.insert((entry.effective_deadline(), fp));
        self.entries.insert(fp, entry);
    }

    /// Remove an entry. A removed entry can never transition again — this
    /// is what makes stem→fluff one-shot.
    pub fn remove(&mut self, fp: &TxFingerprint) -> Option<StemEntry> {
        let entry = self.entries.remove(fp)?;
        self.by_deadline.remove(&(entry.effective_deadline(), *fp));
        Some(entry)
    }

    /// The next timer deadline across the pool.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        self.by_deadline.iter().next().map(|(d, _)| *d)
    }

    /// Pop every entry whose deadline passed.
    pub fn expire(&mut self, now_ms: u64) -> Vec<(TxFingerprint, StemEntry)> {
        let due: Vec<TxFingerprint> = self
            .by_deadline
            .iter()
            .take_while(|(deadline, _)| *deadline <= now_ms)
            .map(|(_, fp)| *fp)
            .collect();
        due.into_iter()
            .filter_map(|fp| self.remove(&fp).map(|e| (fp, e)))
            .collect()
    }

    /// Pop every entry whose forced-fluff height has been reached.
    pub fn confirm_due(&mut self, tip_height: Height) -> Vec<(TxFingerprint, StemEntry)> {
        let due: Vec<TxFingerprint> = self
            .entries
            .iter()
            .filter(|(_, e)| matches!(e.confirm_deadline, Some(h) if tip_height >= h))
            .map(|(fp, _)| *fp)
            .collect();
        due.into_iter()
            .filter_map(|fp| self.remove(&fp).map(|e| (fp, e)))
            .collect()
    }

    /// Pop every entry whose relay peer went away.
    pub fn orphaned_by(&mut self, peer: PeerId) -> Vec<(TxFingerprint, StemEntry)> {
        let orphaned: Vec<TxFingerprint> = self
            .entries
            .iter()
            .filter(|(_, e)| e.relay_peer == Some(peer))
            .map(|(fp, _)| *fp)
            .collect();
        orphaned
            .into_iter()
            .filter_map(|fp| self.remove(&fp).map(|e| (fp, e)))
            .collect()
    }

    /// An aggregating entry a new stem tx could merge into: intersecting
    /// height range and room below the output cap.
    pub fn aggregation_candidate(
        &self,
        range: &HeightRange,
        outputs_max: u32,
    ) -> Option<TxFingerprint> {
        self.entries
            .iter()
            .find(|(_, e)| {
                e.aggregating
                    && (e.tx.outputs.len() as u32) < outputs_max
                    && !e.tx.height_range().intersect(range).is_empty()
            })
            .map(|(fp, _)| *fp)
    }
}

impl Default for StemPool {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Dependent pool
// ---------------------------------------------------------------------------

/// One link of a dependent-transaction chain.
#[derive(Clone, Debug)]
pub struct DependentEntry {
    pub tx: Transaction,
    pub parent: Option<ContextHash>,
    pub context: ContextHash,
    /// Fee accumulated along the chain up to and including this link.
    pub total_fee: u64,
    pub total_weight: usize,
}

/// Off-chain chained transaction contexts built atop the current tip.
///
/// The whole structure resets whenever the tip advances; peers must
/// resubmit still-valid dependents.
pub struct DependentPool {
    by_context: HashMap<ContextHash, DependentEntry>,
    fingerprints: HashSet<TxFingerprint>,
    best: Option<ContextHash>,
}

impl DependentPool {
    pub fn new() -> Self {
        Self {
            by_context: HashMap::new(),
            fingerprints: HashSet::new(),
            best: None,
        }
    }

    pub fn len(&self) -> usize {
        self.by_context.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_context.is_empty()
    }

    pub fn contains_tx(&self, fp: &TxFingerprint) -> bool {
        self.fingerprints.contains(fp)
    }

    pub fn get(&self, ctx: &ContextHash) -> Option<&DependentEntry> {
        self.by_context.get(ctx)
    }

    /// The context of the most profitable known chain.
    pub fn best(&self) -> Option<ContextHash> {
        self.best
    }

    /// Whether a parent context is admissible: `None` builds on the bare
    /// tip, otherwise it must name a known link.
    pub fn parent_known(&self, parent: Option<&ContextHash>) -> bool {
        match parent {
            None => true,
            Some(ctx) => self.by_context.contains_key(ctx),
        }
    }

    /// Add a validated link. Cumulative totals come from the parent link.
    pub fn insert(&mut self, tx: Transaction, parent: Option<ContextHash>, context: ContextHash) {
        let (parent_fee, parent_weight) = parent
            .as_ref()
            .and_then(|p| self.by_context.get(p))
            .map(|e| (e.total_fee, e.total_weight))
            .unwrap_or((0, 0));

        let entry = DependentEntry {
            total_fee: parent_fee + tx.fee(),
            total_weight: parent_weight + tx.weight(),
            parent,
            context,
            tx,
        };
        self.fingerprints.insert(entry.tx.fingerprint());

        let beats_best = match self.best.and_then(|b| self.by_context.get(&b)) {
            None => true,
            Some(best) => {
                // Order by fee rate over the whole chain, then raw fee.
                let lhs = entry.total_fee as u128 * best.total_weight.max(1) as u128;
                let rhs = best.total_fee as u128 * entry.total_weight.max(1) as u128;
                lhs > rhs || (lhs == rhs && entry.total_fee > best.total_fee)
            }
        };
        if beats_best {
            self.best = Some(context);
        }
        self.by_context.insert(context, entry);
    }

    /// The tip advanced: every dependent context is now stale.
    pub fn clear(&mut self) {
        self.by_context.clear();
        self.fingerprints.clear();
        self.best = None;
    }
}

impl Default for DependentPool {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use veil_types::{TxKernel, TxOutput};

    fn tx(id_byte: u8, fee: u64, outputs: usize) -> Transaction {
        Transaction {
            inputs: vec![],
            outputs: (0..outputs)
                .map(|i| TxOutput::new([id_byte.wrapping_add(i as u8); 33]))
                .collect(),
            kernels: vec![TxKernel {
                id: [id_byte; 32],
                fee,
                height_range: HeightRange::OPEN,
            }],
        }
    }

    // -- Fluff -----------------------------------------------------------

    #[test]
    fn fluff_insert_and_duplicate() {
        let mut pool = FluffPool::new(10, usize::MAX);
        let t = tx(1, 100, 1);
        let fp = t.fingerprint();

        assert!(matches!(
            pool.insert(t.clone(), None, 0),
            FluffInsert::Inserted { .. }
        ));
        assert_eq!(pool.insert(t, None, 1), FluffInsert::Duplicate);
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&fp));
    }

    #[test]
    fn fluff_eviction_removes_lowest_fee_rate() {
        let mut pool = FluffPool::new(2, usize::MAX);
        let low = tx(1, 10, 1);
        let mid = tx(2, 500, 1);
        let high = tx(3, 1000, 1);
        let low_fp = low.fingerprint();

        pool.insert(low, None, 0);
        pool.insert(mid, None, 1);
        match pool.insert(high, None, 2) {
            FluffInsert::Inserted { evicted } => assert_eq!(evicted, vec![low_fp]),
            other => panic!("expected Inserted, got {:?}", other),
        }
        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&low_fp));
    }

    #[test]
    fn fluff_full_pool_rejects_below_minimum_without_eviction() {
        let mut pool = FluffPool::new(2, usize::MAX);
        pool.insert(tx(1, 500, 1), None, 0);
        pool.insert(tx(2, 600, 1), None, 1);

        let cheap = tx(3, 10, 1);
        assert_eq!(pool.insert(cheap, None, 2), FluffInsert::BelowMinimum);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.min_fee_rate().unwrap(), tx(1, 500, 1).fee_rate());
    }

    #[test]
    fn fluff_equal_fee_rate_evicts_newest_first() {
        let mut pool = FluffPool::new(2, usize::MAX);
        let older = tx(1, 500, 1);
        let newer = tx(2, 500, 1);
        let newer_fp = newer.fingerprint();
        pool.insert(older.clone(), None, 0);
        pool.insert(newer, None, 1);

        // Equal fee rate is not *below* the minimum, so it may evict; the
        // newest of the equal-rate entries goes first.
        match pool.insert(tx(3, 500, 1), None, 2) {
            FluffInsert::Inserted { evicted } => assert_eq!(evicted, vec![newer_fp]),
            other => panic!("expected Inserted, got {:?}", other),
        }
        assert!(pool.contains(&older.fingerprint()));
    }

    #[test]
    fn fluff_weight_cap_enforced() {
        let unit = tx(1, 100, 1).weight();
        let mut pool = FluffPool::new(100, unit * 2);
        pool.insert(tx(1, 100, 1), None, 0);
        pool.insert(tx(2, 200, 1), None, 1);
        assert_eq!(pool.total_weight(), unit * 2);

        match pool.insert(tx(3, 300, 1), None, 2) {
            FluffInsert::Inserted { evicted } => assert_eq!(evicted.len(), 1),
            other => panic!("expected Inserted, got {:?}", other),
        }
        assert!(pool.total_weight() <= unit * 2);
    }

    #[test]
    fn fluff_announcement_cursor() {
        let mut pool = FluffPool::new(10, usize::MAX);
        let a = tx(1, 100, 1);
        let b = tx(2, 100, 1);
        pool.insert(a.clone(), None, 0);
        pool.insert(b.clone(), None, 1);

        // Cursor 0 = nothing seen yet: both entries stream, in order.
        let all = pool.announced_after(0);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].1, a.fingerprint());
        assert_eq!(all[1].1, b.fingerprint());

        // Advancing the cursor to the first seq leaves only the second.
        let rest = pool.announced_after(all[0].0);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].1, b.fingerprint());

        assert_eq!(pool.latest_seq(), all[1].0);
    }

    #[test]
    fn fluff_template_selection_prefers_fee_rate() {
        let mut pool = FluffPool::new(10, usize::MAX);
        pool.insert(tx(1, 10, 1), None, 0);
        pool.insert(tx(2, 1000, 1), None, 1);
        pool.insert(tx(3, 500, 1), None, 2);

        let picked = pool.select_for_template(usize::MAX);
        let fees: Vec<u64> = picked.iter().map(|e| e.fee).collect();
        assert_eq!(fees, vec![1000, 500, 10]);
    }

    #[test]
    fn fluff_drop_expired_by_height() {
        let mut pool = FluffPool::new(10, usize::MAX);
        let mut dying = tx(1, 100, 1);
        dying.kernels[0].height_range = HeightRange::new(0, 50);
        let dying_fp = dying.fingerprint();
        pool.insert(dying, None, 0);
        pool.insert(tx(2, 100, 1), None, 1);

        let dropped = pool.drop_expired(51);
        assert_eq!(dropped, vec![dying_fp]);
        assert_eq!(pool.len(), 1);
    }

    // -- Stem ------------------------------------------------------------

    fn stem_entry(t: &Transaction, timeout_ms: u64) -> StemEntry {
        StemEntry {
            tx: t.clone(),
            context: None,
            relay_peer: Some(PeerId(9)),
            timeout_at_ms: timeout_ms,
            aggregation_deadline_ms: None,
            aggregating: false,
            fee_reserve: 0,
            confirm_deadline: None,
        }
    }

    #[test]
    fn stem_expiry_order() {
        let mut pool = StemPool::new();
        let a = tx(1, 100, 1);
        let b = tx(2, 100, 1);
        pool.insert(a.fingerprint(), stem_entry(&a, 1000));
        pool.insert(b.fingerprint(), stem_entry(&b, 2000));

        assert_eq!(pool.next_deadline_ms(), Some(1000));
        let expired = pool.expire(1500);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, a.fingerprint());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn stem_remove_is_one_shot() {
        let mut pool = StemPool::new();
        let a = tx(1, 100, 1);
        pool.insert(a.fingerprint(), stem_entry(&a, 1000));
        assert!(pool.remove(&a.fingerprint()).is_some());
        // Second removal finds nothing: a transitioned entry cannot
        // transition again.
        assert!(pool.remove(&a.fingerprint()).is_none());
        assert!(pool.expire(10_000).is_empty());
    }

    #[test]
    fn stem_confirm_deadline_pops_on_height() {
        let mut pool = StemPool::new();
        let a = tx(1, 100, 1);
        let mut e = stem_entry(&a, 100_000);
        e.confirm_deadline = Some(105);
        pool.insert(a.fingerprint(), e);

        assert!(pool.confirm_due(104).is_empty());
        let due = pool.confirm_due(105);
        assert_eq!(due.len(), 1);
        // Entry left every index: the timer can no longer fire for it.
        assert!(pool.expire(200_000).is_empty());
    }

    #[test]
    fn stem_orphaned_by_peer_disconnect() {
        let mut pool = StemPool::new();
        let a = tx(1, 100, 1);
        let b = tx(2, 100, 1);
        let mut eb = stem_entry(&b, 1000);
        eb.relay_peer = Some(PeerId(2));
        pool.insert(a.fingerprint(), stem_entry(&a, 1000));
        pool.insert(b.fingerprint(), eb);

        let orphaned = pool.orphaned_by(PeerId(9));
        assert_eq!(orphaned.len(), 1);
        assert_eq!(orphaned[0].0, a.fingerprint());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn stem_aggregation_deadline_wins_while_aggregating() {
        let mut pool = StemPool::new();
        let a = tx(1, 100, 1);
        let mut e = stem_entry(&a, 50_000);
        e.aggregating = true;
        e.aggregation_deadline_ms = Some(10_000);
        pool.insert(a.fingerprint(), e);
        assert_eq!(pool.next_deadline_ms(), Some(10_000));
    }

    #[test]
    fn stem_aggregation_candidate_respects_caps() {
        let mut pool = StemPool::new();
        let small = tx(1, 100, 2);
        let mut e = stem_entry(&small, 50_000);
        e.aggregating = true;
        pool.insert(small.fingerprint(), e);

        assert_eq!(
            pool.aggregation_candidate(&HeightRange::OPEN, 40),
            Some(small.fingerprint())
        );
        // cap of 2 outputs: the candidate is already full
        assert_eq!(pool.aggregation_candidate(&HeightRange::OPEN, 2), None);
        // disjoint height range: no candidate
        let far = HeightRange::new(1_000_000, 2_000_000);
        let mut ranged = tx(9, 1, 1);
        ranged.kernels[0].height_range = HeightRange::new(0, 10);
        let mut er = stem_entry(&ranged, 50_000);
        er.aggregating = true;
        let mut pool2 = StemPool::new();
        pool2.insert(ranged.fingerprint(), er);
        assert_eq!(pool2.aggregation_candidate(&far, 40), None);
    }

    // -- Dependent -------------------------------------------------------

    #[test]
    fn dependent_chain_accumulates_and_tracks_best() {
        let mut pool = DependentPool::new();
        let ctx1 = ContextHash::new([1; 32]);
        let ctx2 = ContextHash::new([2; 32]);

        let t1 = tx(1, 100, 1);
        let t2 = tx(2, 50, 1);
        assert!(pool.parent_known(None));
        pool.insert(t1.clone(), None, ctx1);
        assert!(pool.parent_known(Some(&ctx1)));
        pool.insert(t2.clone(), Some(ctx1), ctx2);

        let link = pool.get(&ctx2).unwrap();
        assert_eq!(link.total_fee, 150);
        assert_eq!(link.total_weight, t1.weight() + t2.weight());
        assert!(pool.contains_tx(&t1.fingerprint()));
        assert!(pool.contains_tx(&t2.fingerprint()));
    }

    #[test]
    fn dependent_best_prefers_higher_fee_rate() {
        let mut pool = DependentPool::new();
        let cheap_ctx = ContextHash::new([1; 32]);
        let rich_ctx = ContextHash::new([2; 32]);

        pool.insert(tx(1, 10, 1), None, cheap_ctx);
        assert_eq!(pool.best(), Some(cheap_ctx));
        pool.insert(tx(2, 10_000, 1), None, rich_ctx);
        assert_eq!(pool.best(), Some(rich_ctx));
    }

    #[test]
    fn dependent_unknown_parent_is_rejected_by_lookup() {
        let pool = DependentPool::new();
        let ghost = ContextHash::new([9; 32]);
        assert!(!pool.parent_known(Some(&ghost)));
    }

    #[test]
    fn dependent_clears_on_tip_advance() {
        let mut pool = DependentPool::new();
        pool.insert(tx(1, 100, 1), None, ContextHash::new([1; 32]));
        pool.clear();
        assert!(pool.is_empty());
        assert_eq!(pool.best(), None);
        assert!(!pool.contains_tx(&tx(1, 100, 1).fingerprint()));
    }
}
