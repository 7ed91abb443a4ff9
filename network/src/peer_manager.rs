//! Peer address book — ratings, time-decaying penalties, and bans.
//!
//! The address book outlives individual connections: a [`PeerRecord`] is
//! kept (for its rating) even after the session to that peer is torn down.
//! Selection for outbound dials orders candidates by *adjusted* rating,
//! which is the stored rating minus a penalty that decays over time, so a
//! peer that misbehaved recently is deprioritized but not lost forever.

use rand::seq::SliceRandom;
use rand::RngCore;
use std::collections::HashMap;
use std::net::SocketAddr;

use veil_types::NodeId;

// ---------------------------------------------------------------------------
// Rating model
// ---------------------------------------------------------------------------

/// Rating assigned to a freshly discovered peer.
pub const RATING_INITIAL: u32 = 1024;
/// Upper bound on the stored rating.
pub const RATING_MAX: u32 = 10240;
/// Penalty points shed per second.
const PENALTY_DECAY_PER_SEC: u32 = 1;
/// Duration of a ban in seconds.
const BAN_DURATION_S: u64 = 3600;
/// One rating point credited per this many bytes of useful data served.
const REWARD_BYTES_PER_POINT: usize = 4096;

/// Reasons a peer can be penalized. Each carries a fixed penalty value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PenaltyReason {
    /// A request to this peer timed out.
    Timeout,
    /// The peer relayed a transaction that failed validation.
    InvalidTransaction,
    /// The peer delivered a block/header pack that failed validation.
    InvalidBlock,
    /// Malformed message, unsolicited reply, bad signature. Bans outright.
    ProtocolViolation,
}

impl PenaltyReason {
    /// Penalty points added for this reason.
    pub fn penalty(self) -> u32 {
        match self {
            Self::Timeout => 256,
            Self::InvalidTransaction => 512,
            Self::InvalidBlock => 1024,
            Self::ProtocolViolation => u32::MAX, // insane peer, banned outright
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Persistent address-book entry for a remote node.
#[derive(Clone, Debug)]
pub struct PeerRecord {
    /// Node identity, once learned through a handshake or beacon.
    pub id: Option<NodeId>,
    pub addr: SocketAddr,
    pub rating: u32,
    /// Outstanding penalty at the moment it was last updated.
    penalty: u32,
    /// When `penalty` was last updated (seconds).
    penalty_at_s: u64,
    pub last_seen_s: u64,
    pub ban_until_s: Option<u64>,
    /// Whether a live session to this peer currently exists.
    pub connected: bool,
}

impl PeerRecord {
    fn new(addr: SocketAddr, now_s: u64) -> Self {
        Self {
            id: None,
            addr,
            rating: RATING_INITIAL,
            penalty: 0,
            penalty_at_s: now_s,
            last_seen_s: now_s,
            ban_until_s: None,
            connected: false,
        }
    }

    /// Penalty remaining after decay, relative to `now_s`.
    fn penalty_remaining(&self, now_s: u64) -> u32 {
        let elapsed = now_s.saturating_sub(self.penalty_at_s);
        let decayed = elapsed.saturating_mul(PENALTY_DECAY_PER_SEC as u64);
        self.penalty.saturating_sub(decayed.min(u32::MAX as u64) as u32)
    }

    /// Rating with the decayed penalty applied. Live peer selection orders
    /// by this value.
    pub fn adjusted_rating(&self, now_s: u64) -> u32 {
        self.rating.saturating_sub(self.penalty_remaining(now_s))
    }

    pub fn is_banned(&self, now_s: u64) -> bool {
        matches!(self.ban_until_s, Some(until) if now_s < until)
    }
}

// ---------------------------------------------------------------------------
// Peer manager
// ---------------------------------------------------------------------------

/// Central registry for peer discovery, rating, and ban management.
pub struct PeerManager {
    peers: HashMap<SocketAddr, PeerRecord>,
    /// Upper bound on the number of records we track.
    max_peers: usize,
}

impl PeerManager {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            max_peers,
        }
    }

    // -- Discovery -------------------------------------------------------

    /// Add a discovered address. If at capacity, evicts the record with the
    /// lowest adjusted rating when the newcomer would rank higher. Known or
    /// banned addresses are left untouched.
    pub fn add_addr(&mut self, addr: SocketAddr, now_s: u64) {
        if self.peers.contains_key(&addr) {
            return;
        }
        if self.peers.len() >= self.max_peers {
            let worst = self
                .peers
                .values()
                .filter(|p| !p.connected)
                .min_by_key(|p| p.adjusted_rating(now_s))
                .map(|p| (p.addr, p.adjusted_rating(now_s)));
            match worst {
                Some((worst_addr, worst_rating)) if worst_rating < RATING_INITIAL => {
                    tracing::debug!(evicted = %worst_addr, rating = worst_rating,
                        "evicted lowest-rated peer to make room");
                    self.peers.remove(&worst_addr);
                }
                _ => return,
            }
        }
        self.peers.insert(addr, PeerRecord::new(addr, now_s));
    }

    /// Record the node identity behind an address (learned at handshake or
    /// from a beacon datagram).
    pub fn set_id(&mut self, addr: &SocketAddr, id: NodeId) {
        if let Some(p) = self.peers.get_mut(addr) {
            p.id = Some(id);
        }
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&PeerRecord> {
        self.peers.get(addr)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    // -- Session lifecycle -----------------------------------------------

    pub fn mark_connected(&mut self, addr: &SocketAddr, now_s: u64) {
        if let Some(p) = self.peers.get_mut(addr) {
            p.connected = true;
            p.last_seen_s = now_s;
        }
    }

    pub fn mark_disconnected(&mut self, addr: &SocketAddr) {
        if let Some(p) = self.peers.get_mut(addr) {
            p.connected = false;
        }
    }

    pub fn touch(&mut self, addr: &SocketAddr, now_s: u64) {
        if let Some(p) = self.peers.get_mut(addr) {
            p.last_seen_s = now_s;
        }
    }

    // -- Rating ----------------------------------------------------------

    /// Penalize a peer. Returns `true` if the peer ended up banned.
    pub fn penalize(&mut self, addr: &SocketAddr, reason: PenaltyReason, now_s: u64) -> bool {
        let Some(p) = self.peers.get_mut(addr) else {
            return false;
        };

        if reason == PenaltyReason::ProtocolViolation {
            tracing::warn!(peer = %addr, "insane peer, banning");
            p.ban_until_s = Some(now_s + BAN_DURATION_S);
            p.rating = 0;
            p.connected = false;
            return true;
        }

        let remaining = p.penalty_remaining(now_s);
        p.penalty = remaining.saturating_add(reason.penalty());
        p.penalty_at_s = now_s;

        // A peer whose adjusted rating bottoms out gets a timed ban.
        if p.adjusted_rating(now_s) == 0 {
            p.ban_until_s = Some(now_s + BAN_DURATION_S);
            p.connected = false;
            return true;
        }
        false
    }

    /// Credit a peer for useful data served (headers, bodies).
    pub fn reward_data(&mut self, addr: &SocketAddr, bytes: usize) {
        if let Some(p) = self.peers.get_mut(addr) {
            let points = (bytes / REWARD_BYTES_PER_POINT) as u32;
            p.rating = p.rating.saturating_add(points.max(1)).min(RATING_MAX);
        }
    }

    /// Ban an address outright (e.g. fork incompatibility).
    pub fn ban(&mut self, addr: &SocketAddr, now_s: u64) {
        if let Some(p) = self.peers.get_mut(addr) {
            p.ban_until_s = Some(now_s + BAN_DURATION_S);
            p.connected = false;
        }
    }

    pub fn is_banned(&self, addr: &SocketAddr, now_s: u64) -> bool {
        self.peers.get(addr).is_some_and(|p| p.is_banned(now_s))
    }

    /// Clear expired bans and restore a baseline rating.
    pub fn check_bans(&mut self, now_s: u64) {
        for p in self.peers.values_mut() {
            if let Some(until) = p.ban_until_s {
                if now_s >= until {
                    p.ban_until_s = None;
                    p.rating = p.rating.max(RATING_INITIAL / 2);
                }
            }
        }
    }

    // -- Selection -------------------------------------------------------

    /// Dial candidates: not connected, not banned, best adjusted rating
    /// first.
    pub fn connect_candidates(&self, count: usize, now_s: u64) -> Vec<SocketAddr> {
        let mut candidates: Vec<&PeerRecord> = self
            .peers
            .values()
            .filter(|p| !p.connected && !p.is_banned(now_s))
            .collect();
        candidates.sort_by_key(|p| std::cmp::Reverse(p.adjusted_rating(now_s)));
        candidates.iter().take(count).map(|p| p.addr).collect()
    }

    /// Up to `count` random non-banned addresses, for `PeerInfo` resends.
    pub fn random_known(&self, count: usize, now_s: u64, rng: &mut impl RngCore) -> Vec<PeerRecord> {
        let mut known: Vec<&PeerRecord> = self
            .peers
            .values()
            .filter(|p| !p.is_banned(now_s))
            .collect();
        known.shuffle(rng);
        known.iter().take(count).map(|p| (*p).clone()).collect()
    }

    // -- Persistence -----------------------------------------------------

    /// Snapshot for the peer cache: `(addr, rating, last_seen)`.
    pub fn snapshot(&self) -> Vec<(SocketAddr, u32, u64)> {
        self.peers
            .values()
            .map(|p| (p.addr, p.rating, p.last_seen_s))
            .collect()
    }

    /// Restore records loaded from the peer cache.
    pub fn restore(&mut self, entries: &[(SocketAddr, u32, u64)], now_s: u64) {
        for &(addr, rating, last_seen_s) in entries {
            self.add_addr(addr, now_s);
            if let Some(p) = self.peers.get_mut(&addr) {
                p.rating = rating.min(RATING_MAX);
                p.last_seen_s = last_seen_s;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn addr(n: u8) -> SocketAddr {
        format!("10.0.0.{n}:31744").parse().unwrap()
    }

    #[test]
    fn add_and_connect() {
        let mut pm = PeerManager::new(10);
        pm.add_addr(addr(1), 100);
        assert_eq!(pm.len(), 1);
        pm.mark_connected(&addr(1), 101);
        assert!(pm.get(&addr(1)).unwrap().connected);
        pm.mark_disconnected(&addr(1));
        assert!(!pm.get(&addr(1)).unwrap().connected);
    }

    #[test]
    fn penalty_decays_over_time() {
        let mut pm = PeerManager::new(10);
        pm.add_addr(addr(1), 0);
        pm.penalize(&addr(1), PenaltyReason::Timeout, 0);

        let fresh = pm.get(&addr(1)).unwrap().adjusted_rating(0);
        assert_eq!(fresh, RATING_INITIAL - 256);

        // Half the penalty decays after 128 s, all of it after 256 s.
        let half = pm.get(&addr(1)).unwrap().adjusted_rating(128);
        assert_eq!(half, RATING_INITIAL - 128);
        let full = pm.get(&addr(1)).unwrap().adjusted_rating(256);
        assert_eq!(full, RATING_INITIAL);
    }

    #[test]
    fn protocol_violation_bans_outright() {
        let mut pm = PeerManager::new(10);
        pm.add_addr(addr(1), 0);
        assert!(pm.penalize(&addr(1), PenaltyReason::ProtocolViolation, 0));
        assert!(pm.is_banned(&addr(1), 10));
        assert!(!pm.is_banned(&addr(1), 3600));
    }

    #[test]
    fn repeated_penalties_reach_ban() {
        let mut pm = PeerManager::new(10);
        pm.add_addr(addr(1), 0);
        // 1024 / 256 = 4 timeouts at the same instant exhaust the rating.
        for _ in 0..3 {
            assert!(!pm.penalize(&addr(1), PenaltyReason::Timeout, 0));
        }
        assert!(pm.penalize(&addr(1), PenaltyReason::Timeout, 0));
        assert!(pm.is_banned(&addr(1), 0));
    }

    #[test]
    fn ban_expiry_restores_baseline() {
        let mut pm = PeerManager::new(10);
        pm.add_addr(addr(1), 0);
        pm.penalize(&addr(1), PenaltyReason::ProtocolViolation, 1000);
        pm.check_bans(1000 + 3599);
        assert!(pm.is_banned(&addr(1), 1000 + 3599));
        pm.check_bans(1000 + 3600);
        assert!(!pm.is_banned(&addr(1), 1000 + 3600));
        assert_eq!(pm.get(&addr(1)).unwrap().rating, RATING_INITIAL / 2);
    }

    #[test]
    fn reward_is_capped() {
        let mut pm = PeerManager::new(10);
        pm.add_addr(addr(1), 0);
        pm.reward_data(&addr(1), usize::MAX);
        assert_eq!(pm.get(&addr(1)).unwrap().rating, RATING_MAX);
    }

    #[test]
    fn candidates_ordered_by_adjusted_rating() {
        let mut pm = PeerManager::new(10);
        pm.add_addr(addr(1), 0);
        pm.add_addr(addr(2), 0);
        pm.add_addr(addr(3), 0);
        pm.reward_data(&addr(2), 8 * 4096);
        pm.penalize(&addr(3), PenaltyReason::Timeout, 0);

        let c = pm.connect_candidates(10, 0);
        assert_eq!(c[0], addr(2));
        assert_eq!(c[2], addr(3));
    }

    #[test]
    fn candidates_exclude_connected_and_banned() {
        let mut pm = PeerManager::new(10);
        pm.add_addr(addr(1), 0);
        pm.add_addr(addr(2), 0);
        pm.add_addr(addr(3), 0);
        pm.mark_connected(&addr(1), 0);
        pm.ban(&addr(2), 0);

        let c = pm.connect_candidates(10, 0);
        assert_eq!(c, vec![addr(3)]);
    }

    #[test]
    fn capacity_eviction_prefers_low_rated() {
        let mut pm = PeerManager::new(2);
        pm.add_addr(addr(1), 0);
        pm.add_addr(addr(2), 0);
        pm.penalize(&addr(1), PenaltyReason::Timeout, 0);

        pm.add_addr(addr(3), 0);
        assert_eq!(pm.len(), 2);
        assert!(pm.get(&addr(1)).is_none());
        assert!(pm.get(&addr(3)).is_some());
    }

    #[test]
    fn capacity_keeps_equal_rated_incumbents() {
        let mut pm = PeerManager::new(2);
        pm.add_addr(addr(1), 0);
        pm.add_addr(addr(2), 0);
        pm.add_addr(addr(3), 0);
        assert_eq!(pm.len(), 2);
        assert!(pm.get(&addr(3)).is_none());
    }

    #[test]
    fn snapshot_restore_roundtrip() {
        let mut pm = PeerManager::new(10);
        pm.add_addr(addr(1), 50);
        pm.reward_data(&addr(1), 4096 * 4);
        let snap = pm.snapshot();

        let mut pm2 = PeerManager::new(10);
        pm2.restore(&snap, 60);
        let rec = pm2.get(&addr(1)).unwrap();
        assert_eq!(rec.rating, RATING_INITIAL + 4);
        assert_eq!(rec.last_seen_s, 50);
    }

    #[test]
    fn random_known_skips_banned() {
        let mut pm = PeerManager::new(10);
        pm.add_addr(addr(1), 0);
        pm.add_addr(addr(2), 0);
        pm.ban(&addr(2), 0);
        let mut rng = StdRng::seed_from_u64(42);
        let known = pm.random_known(10, 0, &mut rng);
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].addr, addr(1));
    }
}
