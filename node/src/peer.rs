//! Peer session state.
//!
//! One [`PeerSession`] per live connection. The session holds everything
//! scoped to the connection lifetime: flag bits, the remote tip, the bound
//! task queue, outbound byte accounting (chocking/drown), BBS channel
//! subscriptions, the fluff-pool announcement cursor, and the per-key
//! timeout memory. Address-book state (`veil_network::PeerRecord`) outlives
//! the session and is tracked separately.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;

use veil_messages::LoginFlags;
use veil_types::{BlockHeader, ContextHash, Height, NodeId};

use crate::tasks::TaskKey;

/// Timeouts on the same key before the key is blacklisted for this
/// connection.
const REJECT_KEY_AFTER_TIMEOUTS: u32 = 2;

/// Consecutive request timeouts before the connection itself is dropped.
pub const DISCONNECT_AFTER_TIMEOUTS: u32 = 4;

/// EWMA weight (out of 100) given to each new latency sample.
const LATENCY_SAMPLE_WEIGHT: u64 = 20;

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// Session state bitset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerFlags(pub u16);

impl PeerFlags {
    /// TCP established, handshake in progress.
    pub const CONNECTED: u16 = 0x001;
    /// Login received; the session may carry tasks and pool traffic.
    pub const LOGIN_RECEIVED: u16 = 0x002;
    /// Authenticated with the owner key.
    pub const OWNER: u16 = 0x004;
    /// Short-lived connection made only to probe reachability.
    pub const PROBE: u16 = 0x008;
    /// We already sent this peer our serif (identity attestation).
    pub const SERIF_SENT: u16 = 0x010;
    /// Peer claims to have the treasury blob.
    pub const HAS_TREASURY: u16 = 0x100;
    /// Outbound queue above the chocking threshold; no new tasks.
    pub const CHOCKING: u16 = 0x200;
    /// Connection arrived through the acceptor (inbound).
    pub const ACCEPTED: u16 = 0x800;
    /// Session is tearing down; drop all further messages.
    pub const STOPPING: u16 = 0x1000;

    pub fn contains(&self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    pub fn insert(&mut self, bit: u16) {
        self.0 |= bit;
    }

    pub fn remove(&mut self, bit: u16) {
        self.0 &= !bit;
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Reactor-assigned session identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Per-connection state.
pub struct PeerSession {
    pub id: PeerId,
    pub addr: SocketAddr,
    /// Set after a verified `Authentication`.
    pub node_id: Option<NodeId>,
    /// The nonce our secure channel handed the remote to sign.
    pub channel_nonce: [u8; 32],
    pub flags: PeerFlags,
    pub login_flags: LoginFlags,
    pub min_peer_fork: Height,
    /// Last tip the peer announced.
    pub tip: Option<BlockHeader>,
    /// Fetch tasks bound to this peer, in assignment order. The first
    /// entry drives the request timer.
    pub tasks: VecDeque<TaskKey>,
    /// Keys this peer repeatedly failed to serve; never re-assigned for
    /// the connection lifetime. Cleared on `NewTip`.
    pub rejected_keys: HashSet<TaskKey>,
    timeout_counts: HashMap<TaskKey, u32>,
    /// Consecutive request timeouts on this connection.
    pub consecutive_timeouts: u32,
    /// Bytes queued to the socket and not yet reported drained.
    pub outbound_bytes: usize,
    /// BBS channels this peer subscribed to.
    pub subscriptions: HashSet<u64>,
    /// Fluff-pool sequence cursor for `HaveTransaction` streaming.
    pub tx_cursor: u64,
    /// Dependent context the peer declared via `SetDependentContext`.
    pub dependent_ctx: Option<ContextHash>,
    /// Smoothed request round-trip time.
    latency_ewma_ms: u64,
    /// Deadline for the pong watchdog, when a ping is outstanding.
    pub pong_deadline_ms: Option<u64>,
    pub last_activity_ms: u64,
}

impl PeerSession {
    pub fn new(id: PeerId, addr: SocketAddr, inbound: bool, nonce: [u8; 32], now_ms: u64) -> Self {
        let mut flags = PeerFlags::default();
        flags.insert(PeerFlags::CONNECTED);
        if inbound {
            flags.insert(PeerFlags::ACCEPTED);
        }
        Self {
            id,
            addr,
            node_id: None,
            channel_nonce: nonce,
            flags,
            login_flags: LoginFlags::default(),
            min_peer_fork: 0,
            tip: None,
            tasks: VecDeque::new(),
            rejected_keys: HashSet::new(),
            timeout_counts: HashMap::new(),
            consecutive_timeouts: 0,
            outbound_bytes: 0,
            subscriptions: HashSet::new(),
            tx_cursor: 0,
            dependent_ctx: None,
            latency_ewma_ms: 0,
            pong_deadline_ms: None,
            last_activity_ms: now_ms,
        }
    }

    // -- Readiness -------------------------------------------------------

    pub fn is_logged_in(&self) -> bool {
        self.flags.contains(PeerFlags::LOGIN_RECEIVED)
            && !self.flags.contains(PeerFlags::STOPPING)
    }

    /// Whether the assignment engine may bind tasks to this peer at all.
    pub fn accepts_tasks(&self) -> bool {
        self.is_logged_in() && !self.flags.contains(PeerFlags::CHOCKING)
    }

    /// Whether this peer can serve `key` given its announced tip and its
    /// per-connection blacklist.
    pub fn can_serve(&self, key: &TaskKey) -> bool {
        if self.rejected_keys.contains(key) {
            return false;
        }
        match &self.tip {
            Some(tip) => tip.height >= key.0.height,
            None => false,
        }
    }

    pub fn queued_count(&self, is_body: bool) -> u32 {
        self.tasks.iter().filter(|k| k.1 == is_body).count() as u32
    }

    // -- Outbound accounting ---------------------------------------------

    /// Account for bytes handed to the socket. Returns the new total so
    /// the caller can check the chocking/drown thresholds.
    pub fn queue_bytes(&mut self, bytes: usize) -> usize {
        self.outbound_bytes += bytes;
        self.outbound_bytes
    }

    /// Account for bytes the transport flushed.
    pub fn drained(&mut self, bytes: usize) -> usize {
        self.outbound_bytes = self.outbound_bytes.saturating_sub(bytes);
        self.outbound_bytes
    }

    // -- Latency / timeout memory ----------------------------------------

    pub fn record_latency(&mut self, sample_ms: u64) {
        if self.latency_ewma_ms == 0 {
            self.latency_ewma_ms = sample_ms;
        } else {
            self.latency_ewma_ms = (self.latency_ewma_ms * (100 - LATENCY_SAMPLE_WEIGHT)
                + sample_ms * LATENCY_SAMPLE_WEIGHT)
                / 100;
        }
    }

    pub fn latency_ms(&self) -> u64 {
        self.latency_ewma_ms
    }

    /// Record a timeout on `key`. After enough strikes the key joins the
    /// connection's blacklist.
    pub fn note_timeout(&mut self, key: TaskKey) {
        self.consecutive_timeouts += 1;
        let count = self.timeout_counts.entry(key).or_insert(0);
        *count += 1;
        if *count >= REJECT_KEY_AFTER_TIMEOUTS {
            self.rejected_keys.insert(key);
        }
    }

    pub fn note_success(&mut self) {
        self.consecutive_timeouts = 0;
    }

    /// `NewTip` implies the peer's data set changed; give blacklisted keys
    /// another chance.
    pub fn clear_rejected(&mut self) {
        self.rejected_keys.clear();
        self.timeout_counts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_types::{BlockHash, BlockId, ChainWork, Timestamp};

    fn session() -> PeerSession {
        PeerSession::new(
            PeerId(1),
            "10.0.0.1:31744".parse().unwrap(),
            false,
            [0; 32],
            0,
        )
    }

    fn tip(height: Height) -> BlockHeader {
        BlockHeader {
            height,
            prev: BlockHash::ZERO,
            chain_work: ChainWork(height as u128),
            timestamp: Timestamp::new(0),
            pow_nonce: 0,
        }
    }

    fn key(height: Height) -> TaskKey {
        (BlockId::new(height, BlockHash::new([1; 32])), true)
    }

    #[test]
    fn task_acceptance_requires_login() {
        let mut s = session();
        assert!(!s.accepts_tasks());
        s.flags.insert(PeerFlags::LOGIN_RECEIVED);
        assert!(s.accepts_tasks());
        s.flags.insert(PeerFlags::CHOCKING);
        assert!(!s.accepts_tasks());
    }

    #[test]
    fn can_serve_checks_tip_height() {
        let mut s = session();
        assert!(!s.can_serve(&key(5)));
        s.tip = Some(tip(10));
        assert!(s.can_serve(&key(5)));
        assert!(s.can_serve(&key(10)));
        assert!(!s.can_serve(&key(11)));
    }

    #[test]
    fn repeated_timeouts_blacklist_key() {
        let mut s = session();
        s.tip = Some(tip(100));
        s.note_timeout(key(5));
        assert!(s.can_serve(&key(5)));
        s.note_timeout(key(5));
        assert!(!s.can_serve(&key(5)));

        s.clear_rejected();
        assert!(s.can_serve(&key(5)));
    }

    #[test]
    fn consecutive_timeouts_reset_on_success() {
        let mut s = session();
        s.note_timeout(key(1));
        s.note_timeout(key(2));
        assert_eq!(s.consecutive_timeouts, 2);
        s.note_success();
        assert_eq!(s.consecutive_timeouts, 0);
    }

    #[test]
    fn outbound_accounting_saturates() {
        let mut s = session();
        assert_eq!(s.queue_bytes(100), 100);
        assert_eq!(s.queue_bytes(50), 150);
        assert_eq!(s.drained(200), 0);
    }

    #[test]
    fn latency_ewma_converges() {
        let mut s = session();
        s.record_latency(100);
        assert_eq!(s.latency_ms(), 100);
        for _ in 0..50 {
            s.record_latency(500);
        }
        assert!(s.latency_ms() > 450);
    }

    #[test]
    fn queued_count_splits_by_kind() {
        let mut s = session();
        s.tasks.push_back((BlockId::new(1, BlockHash::ZERO), true));
        s.tasks.push_back((BlockId::new(2, BlockHash::ZERO), false));
        s.tasks.push_back((BlockId::new(3, BlockHash::ZERO), true));
        assert_eq!(s.queued_count(true), 2);
        assert_eq!(s.queued_count(false), 1);
    }
}
