//! Reactor input events, output actions, and observer callbacks.
//!
//! Everything that happens to the node arrives as one [`NodeEvent`] on the
//! reactor; everything the node wants done to the outside world leaves as
//! [`NodeAction`]s. The observer is a capability set configured at
//! construction — absent callbacks are simply not invoked.

use std::net::SocketAddr;

use veil_messages::{ByeReason, WireMessage};
use veil_types::{BlockId, NodeId, Transaction};

use crate::peer::PeerId;
use crate::sync::SyncProgress;
use crate::workers::JobDone;

/// Coarse timer classes fired by the runtime. Handlers only act on items
/// whose deadlines have actually passed, so spurious firings are harmless.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    /// Sweeps every per-item deadline set: wanted items, stem timers,
    /// request timeouts, pong watchdogs.
    Tick,
    /// Connection maintenance and congestion re-evaluation.
    PeersUpdate,
    /// Flush the address book to the peer cache.
    PeersFlush,
    /// Resend known peer addresses to connected peers.
    PeersResend,
    /// Expired-BBS-message sweep.
    BbsCleanup,
    /// Mining template soft-restart check.
    MinerRestart,
}

/// One unit of reactor input.
#[derive(Debug)]
pub enum NodeEvent {
    /// Transport established a connection. The secure channel supplies the
    /// nonce the remote must sign in its `Authentication`.
    PeerConnected {
        peer: PeerId,
        addr: SocketAddr,
        inbound: bool,
        channel_nonce: [u8; 32],
    },
    /// Transport lost a connection (any cause).
    PeerDisconnected { peer: PeerId },
    /// A decoded wire message from a peer, in arrival order.
    Message { from: PeerId, msg: WireMessage },
    /// A timer class fired.
    Timer(TimerKind),
    /// A verification worker finished a job.
    WorkerDone(JobDone),
    /// The UDP beacon heard a neighbor.
    BeaconRx { node_id: NodeId, addr: SocketAddr },
    /// Transport flushed this many queued outbound bytes for a peer.
    OutboundDrained { peer: PeerId, bytes: usize },
    /// A mining thread or the external solver produced a solution.
    MinedSolution { job_id: u64, pow_nonce: u64 },
    /// A transaction submitted locally (wallet/RPC side).
    LocalTransaction { tx: Transaction, fluff: bool },
}

/// One unit of reactor output, applied by the runtime in order.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeAction {
    /// Queue a message to a peer's socket.
    Send { peer: PeerId, msg: WireMessage },
    /// Close a peer's connection after flushing its queue.
    Disconnect { peer: PeerId, reason: ByeReason },
    /// Dial an address from the address book.
    Dial { addr: SocketAddr },
}

/// Error classes surfaced through `on_sync_error`. All of them leave the
/// node alive but no longer making sync progress without intervention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncError {
    Unknown,
    /// Peer clocks disagree with ours beyond tolerance.
    TimeDrift,
    /// A stronger branch requires a rollback deeper than policy allows.
    RollbackExceedsLimit,
    /// Database or verification fault; operator intervention required.
    Fatal,
}

/// Observer capability set. Configured once at construction; fields left
/// `None` are skipped.
#[derive(Default)]
pub struct NodeCallbacks {
    pub on_sync_progress: Option<Box<dyn FnMut(SyncProgress) + Send>>,
    pub on_state_changed: Option<Box<dyn FnMut(&BlockId) + Send>>,
    pub on_rolled_back: Option<Box<dyn FnMut(&BlockId) + Send>>,
    pub on_sync_error: Option<Box<dyn FnMut(SyncError) + Send>>,
}

impl NodeCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync_progress(&mut self, progress: SyncProgress) {
        if let Some(cb) = self.on_sync_progress.as_mut() {
            cb(progress);
        }
    }

    pub fn state_changed(&mut self, id: &BlockId) {
        if let Some(cb) = self.on_state_changed.as_mut() {
            cb(id);
        }
    }

    pub fn rolled_back(&mut self, id: &BlockId) {
        if let Some(cb) = self.on_rolled_back.as_mut() {
            cb(id);
        }
    }

    pub fn sync_error(&mut self, error: SyncError) {
        if let Some(cb) = self.on_sync_error.as_mut() {
            cb(error);
        }
    }
}

impl std::fmt::Debug for NodeCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCallbacks")
            .field("on_sync_progress", &self.on_sync_progress.is_some())
            .field("on_state_changed", &self.on_state_changed.is_some())
            .field("on_rolled_back", &self.on_rolled_back.is_some())
            .field("on_sync_error", &self.on_sync_error.is_some())
            .finish()
    }
}
