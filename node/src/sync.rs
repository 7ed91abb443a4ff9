//! Chain synchronization state machine.
//!
//! The controller tracks which phase of catch-up the node is in and the
//! weighted progress through the current round. It makes the policy
//! decisions (when to re-enter header sync, whether a rollback is allowed)
//! while the reactor does the plumbing: creating tasks, talking to the
//! Processor, and reporting completions back here.
//!
//! States: `Idle → HeaderSync → FastSyncBodies → Tip`, with `Congested`
//! entered from any active phase when no eligible peer can serve the
//! outstanding tasks.

use veil_types::{BlockId, Height};

use crate::processor::FastSyncWindow;

/// Weight of one header in the progress figure.
const WEIGHT_HDR: u64 = 1;
/// Weight of one body in the progress figure.
const WEIGHT_BODY: u64 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// No tip (or genesis only); waiting for the first usable peer tip.
    Idle,
    /// Downloading header packs toward the target tip.
    HeaderSync,
    /// Downloading bodies inside the fast-sync window.
    FastSyncBodies,
    /// Caught up; following `NewTip` announcements.
    Tip,
    /// No eligible peer can serve the outstanding tasks.
    Congested,
}

/// Weighted sync progress: headers count 1, bodies count 8.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncProgress {
    pub done: u64,
    pub total: u64,
}

impl SyncProgress {
    /// Completion in `[0, 1]`; a zero total reads as complete.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.done as f64 / self.total as f64
        }
    }
}

/// The synchronization controller.
pub struct SyncController {
    state: SyncState,
    /// Phase to resume when congestion clears.
    resume_state: SyncState,
    target: Option<BlockId>,
    window: Option<FastSyncWindow>,
    hdrs_total: u64,
    hdrs_done: u64,
    bodies_total: u64,
    bodies_done: u64,
    /// When the current tip was adopted (seconds). Gates deep rollback.
    tip_adopted_at_s: u64,
}

impl SyncController {
    pub fn new() -> Self {
        Self {
            state: SyncState::Idle,
            resume_state: SyncState::Idle,
            target: None,
            window: None,
            hdrs_total: 0,
            hdrs_done: 0,
            bodies_total: 0,
            bodies_done: 0,
            tip_adopted_at_s: 0,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn target(&self) -> Option<BlockId> {
        self.target
    }

    pub fn window(&self) -> Option<FastSyncWindow> {
        self.window
    }

    // -- Progress --------------------------------------------------------

    pub fn progress(&self) -> SyncProgress {
        SyncProgress {
            done: self.hdrs_done * WEIGHT_HDR + self.bodies_done * WEIGHT_BODY,
            total: self.hdrs_total * WEIGHT_HDR + self.bodies_total * WEIGHT_BODY,
        }
    }

    // -- Phase transitions -----------------------------------------------

    /// Start (or restart) a header round from `local_height` toward
    /// `target`. The progress baseline is re-anchored to this round.
    pub fn begin_header_round(&mut self, local_height: Height, target: BlockId) {
        self.state = SyncState::HeaderSync;
        self.target = Some(target);
        self.window = None;
        self.hdrs_total = target.height.saturating_sub(local_height);
        self.hdrs_done = 0;
        // Bodies for the coming window are added when the window is known;
        // until then the estimate assumes the full span needs bodies.
        self.bodies_total = self.hdrs_total;
        self.bodies_done = 0;
        tracing::info!(
            from = local_height,
            to = target.height,
            "entering header sync"
        );
    }

    /// Extend the current round's target (the network moved while we were
    /// syncing).
    pub fn extend_target(&mut self, target: BlockId) {
        if let Some(current) = self.target {
            if target.height > current.height {
                self.hdrs_total += target.height - current.height;
                self.bodies_total += target.height - current.height;
                self.target = Some(target);
            }
        }
    }

    pub fn note_headers_applied(&mut self, count: u64) {
        self.hdrs_done = (self.hdrs_done + count).min(self.hdrs_total);
    }

    /// Whether the applied headers reach the round's target.
    pub fn headers_complete(&self, covered_height: Height) -> bool {
        matches!(self.target, Some(t) if covered_height >= t.height)
    }

    /// Headers are done; switch to body download inside `window`. The
    /// body total becomes exact now that the window is known.
    pub fn begin_body_phase(&mut self, window: FastSyncWindow) {
        let Some(target) = self.target else {
            return;
        };
        self.state = SyncState::FastSyncBodies;
        self.window = Some(window);
        self.bodies_total = target.height.saturating_sub(window.h0) + 1;
        self.bodies_done = 0;
        tracing::info!(h0 = window.h0, h_txo_lo = window.h_txo_lo, "entering fast-sync body download");
    }

    pub fn note_body_applied(&mut self) {
        self.bodies_done = (self.bodies_done + 1).min(self.bodies_total);
    }

    /// Fast sync finished; the node now follows the tip.
    pub fn enter_tip(&mut self, now_s: u64) {
        self.state = SyncState::Tip;
        self.window = None;
        self.target = None;
        self.bodies_done = self.bodies_total;
        self.hdrs_done = self.hdrs_total;
        self.tip_adopted_at_s = now_s;
        tracing::info!("sync complete, at tip");
    }

    /// A `NewTip` in `Tip` state: fetch the single missing block when the
    /// gap is 1, re-enter header sync beyond `resync_gap`.
    pub fn tip_gap_action(gap: Height, resync_gap: Height) -> TipGapAction {
        if gap == 0 {
            TipGapAction::None
        } else if gap <= resync_gap {
            TipGapAction::FetchBlocks
        } else {
            TipGapAction::Resync
        }
    }

    // -- Tip bookkeeping -------------------------------------------------

    /// Called on every `NewState` from the Processor.
    pub fn on_tip_adopted(&mut self, now_s: u64) {
        self.tip_adopted_at_s = now_s;
    }

    pub fn tip_age_s(&self, now_s: u64) -> u64 {
        now_s.saturating_sub(self.tip_adopted_at_s)
    }

    // -- Rollback policy -------------------------------------------------

    /// Whether an automatic rollback of `depth` blocks is permitted.
    ///
    /// Within `max_auto` it always is; deeper rollback requires the tip to
    /// have gone stale (`timeout_since_tip_s`). The consensus hard cap
    /// applies in both cases.
    pub fn rollback_allowed(
        &self,
        depth: Height,
        now_s: u64,
        max_auto: Height,
        timeout_since_tip_s: u64,
        hard_cap: Height,
    ) -> bool {
        if depth > hard_cap {
            return false;
        }
        depth <= max_auto || self.tip_age_s(now_s) >= timeout_since_tip_s
    }

    // -- Congestion ------------------------------------------------------

    /// No eligible peer can serve the outstanding tasks.
    pub fn enter_congested(&mut self) {
        if self.state != SyncState::Congested {
            self.resume_state = self.state;
            self.state = SyncState::Congested;
            tracing::warn!("sync congested: no eligible peer for outstanding tasks");
        }
    }

    /// Progress became possible again.
    pub fn leave_congested(&mut self) {
        if self.state == SyncState::Congested {
            self.state = self.resume_state;
        }
    }
}

/// Decision for a tip gap observed in `Tip` state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TipGapAction {
    None,
    /// Request the missing block(s) directly.
    FetchBlocks,
    /// Fall back to header sync.
    Resync,
}

impl Default for SyncController {
    fn default() -> Self {
        Self::new()
    }
}
