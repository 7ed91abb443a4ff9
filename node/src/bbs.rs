//! Bulletin-board message replication.
//!
//! A time-bounded store of `(channel, id, payload, expiry)` records with
//! per-channel peer subscriptions. Announcements fan out as `BbsHaveMsg`;
//! interested peers pull with `BbsGetMsg`. Totals (count, bytes) are
//! maintained incrementally and bounded: a publish that would exceed the
//! limits evicts oldest-first until it fits.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use sha2::{Digest, Sha256};

use veil_messages::BbsMessage;
use veil_store::{BbsRecord, BbsTotals};
use veil_types::{BbsMsgId, Timestamp};

use crate::peer::PeerId;

/// Largest accepted message payload.
pub const MAX_BBS_MSG_SIZE: usize = 1024 * 1024;

/// Message identity: `sha256(channel ‖ timestamp ‖ payload)`.
pub fn bbs_msg_id(msg: &BbsMessage) -> BbsMsgId {
    let mut hasher = Sha256::new();
    hasher.update(msg.channel.to_le_bytes());
    hasher.update(msg.timestamp.as_secs().to_le_bytes());
    hasher.update(&msg.payload);
    BbsMsgId::new(hasher.finalize().into())
}

#[derive(Clone, Debug)]
struct Stored {
    msg: BbsMessage,
    expires_at: Timestamp,
    seq: u64,
}

/// Outcome of a publish attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Stored; announce the id to `subscribers`.
    Stored {
        id: BbsMsgId,
        evicted: Vec<BbsMsgId>,
        subscribers: Vec<PeerId>,
    },
    Duplicate,
    /// Already expired on arrival.
    Expired,
    TooLarge,
    /// Would not fit even after evicting everything else.
    LimitsExceeded,
}

/// The replicator: message store, totals, and the dual-indexed
/// subscription table.
pub struct BbsReplicator {
    msgs: HashMap<BbsMsgId, Stored>,
    /// Posted-time order: eviction source and cleanup frontier. Since
    /// every expiry is `posted + retention`, this is also expiry order.
    by_age: BTreeSet<(Timestamp, u64, BbsMsgId)>,
    /// `(channel, seq)` — backlog streaming in admission order.
    by_channel: BTreeMap<(u64, u64), BbsMsgId>,
    totals: BbsTotals,
    limit_count: u64,
    limit_bytes: u64,
    retention_s: u64,
    next_seq: u64,
    subs_by_channel: HashMap<u64, BTreeSet<PeerId>>,
    subs_by_peer: HashMap<PeerId, HashSet<u64>>,
}

impl BbsReplicator {
    pub fn new(limit_count: u64, limit_bytes: u64, retention_s: u64) -> Self {
        Self {
            msgs: HashMap::new(),
            by_age: BTreeSet::new(),
            by_channel: BTreeMap::new(),
            totals: BbsTotals::default(),
            limit_count,
            limit_bytes,
            retention_s,
            next_seq: 1,
            subs_by_channel: HashMap::new(),
            subs_by_peer: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limit_count > 0
    }

    pub fn totals(&self) -> BbsTotals {
        self.totals
    }

    pub fn contains(&self, id: &BbsMsgId) -> bool {
        self.msgs.contains_key(id)
    }

    pub fn get(&self, id: &BbsMsgId) -> Option<&BbsMessage> {
        self.msgs.get(id).map(|s| &s.msg)
    }

    // -- Publish ---------------------------------------------------------

    pub fn publish(&mut self, msg: BbsMessage, now: Timestamp) -> PublishOutcome {
        if msg.payload.len() > MAX_BBS_MSG_SIZE {
            return PublishOutcome::TooLarge;
        }
        if msg.timestamp.has_expired(self.retention_s, now) {
            return PublishOutcome::Expired;
        }
        let id = bbs_msg_id(&msg);
        if self.msgs.contains_key(&id) {
            return PublishOutcome::Duplicate;
        }
        let bytes = msg.payload.len() as u64;
        if bytes > self.limit_bytes || self.limit_count == 0 {
            return PublishOutcome::LimitsExceeded;
        }

        // Oldest-first eviction until the newcomer fits.
        let mut evicted = Vec::new();
        while self.totals.count + 1 > self.limit_count
            || self.totals.bytes + bytes > self.limit_bytes
        {
            let Some(&(_, _, victim)) = self.by_age.iter().next() else {
                return PublishOutcome::LimitsExceeded;
            };
            self.remove(&victim);
            evicted.push(victim);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let expires_at = Timestamp::new(msg.timestamp.as_secs() + self.retention_s);
        self.by_age.insert((msg.timestamp, seq, id));
        self.by_channel.insert((msg.channel, seq), id);
        let subscribers = self.subscribers(msg.channel);
        self.msgs.insert(
            id,
            Stored {
                msg,
                expires_at,
                seq,
            },
        );
        self.totals.count += 1;
        self.totals.bytes += bytes;

        PublishOutcome::Stored {
            id,
            evicted,
            subscribers,
        }
    }

    fn remove(&mut self, id: &BbsMsgId) -> Option<Stored> {
        let stored = self.msgs.remove(id)?;
        self.by_age.remove(&(stored.msg.timestamp, stored.seq, *id));
        self.by_channel.remove(&(stored.msg.channel, stored.seq));
        self.totals.count -= 1;
        self.totals.bytes -= stored.msg.payload.len() as u64;
        Some(stored)
    }

    /// Periodic sweep: drop everything whose expiry passed. Returns the
    /// removed ids so the persistence layer can delete them too.
    pub fn cleanup(&mut self, now: Timestamp) -> Vec<BbsMsgId> {
        let mut removed = Vec::new();
        while let Some(&(_, _, id)) = self.by_age.iter().next() {
            let due = self
                .msgs
                .get(&id)
                .map(|s| s.expires_at <= now)
                .unwrap_or(true);
            if !due {
                break;
            }
            self.remove(&id);
            removed.push(id);
        }
        if !removed.is_empty() {
            tracing::debug!(count = removed.len(), "bbs cleanup removed expired messages");
        }
        removed
    }

    // -- Subscriptions ---------------------------------------------------

    /// Subscribe a peer to a channel and return the backlog of message ids
    /// posted at or after `time_from`, in admission order. Subscribing
    /// twice is idempotent (the backlog is simply returned again).
    pub fn subscribe(&mut self, peer: PeerId, channel: u64, time_from: Timestamp) -> Vec<BbsMsgId> {
        self.subs_by_channel.entry(channel).or_default().insert(peer);
        self.subs_by_peer.entry(peer).or_default().insert(channel);
        self.backlog(channel, time_from)
    }

    /// Unsubscribe; unsubscribing an unsubscribed channel is a no-op.
    pub fn unsubscribe(&mut self, peer: PeerId, channel: u64) {
        if let Some(peers) = self.subs_by_channel.get_mut(&channel) {
            peers.remove(&peer);
            if peers.is_empty() {
                self.subs_by_channel.remove(&channel);
            }
        }
        if let Some(channels) = self.subs_by_peer.get_mut(&peer) {
            channels.remove(&channel);
            if channels.is_empty() {
                self.subs_by_peer.remove(&peer);
            }
        }
    }

    /// Tear down every subscription of a disconnecting peer.
    pub fn drop_peer(&mut self, peer: PeerId) {
        if let Some(channels) = self.subs_by_peer.remove(&peer) {
            for channel in channels {
                if let Some(peers) = self.subs_by_channel.get_mut(&channel) {
                    peers.remove(&peer);
                    if peers.is_empty() {
                        self.subs_by_channel.remove(&channel);
                    }
                }
            }
        }
    }

    pub fn subscribers(&self, channel: u64) -> Vec<PeerId> {
        self.subs_by_channel
            .get(&channel)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn channels_of(&self, peer: PeerId) -> Vec<u64> {
        self.subs_by_peer
            .get(&peer)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Message ids on `channel` posted at or after `time_from`.
    pub fn backlog(&self, channel: u64, time_from: Timestamp) -> Vec<BbsMsgId> {
        self.by_channel
            .range((channel, 0)..=(channel, u64::MAX))
            .filter_map(|(_, id)| {
                let stored = self.msgs.get(id)?;
                (stored.msg.timestamp >= time_from).then_some(*id)
            })
            .collect()
    }

    /// Backlog across every channel `peer` subscribed to (`BbsResetSync`).
    pub fn backlog_for_peer(&self, peer: PeerId, time_from: Timestamp) -> Vec<BbsMsgId> {
        self.channels_of(peer)
            .into_iter()
            .flat_map(|channel| self.backlog(channel, time_from))
            .collect()
    }

    // -- Persistence -----------------------------------------------------

    pub fn records(&self) -> Vec<BbsRecord> {
        self.msgs
            .iter()
            .map(|(id, s)| BbsRecord {
                id: *id,
                msg: s.msg.clone(),
                expires_at: s.expires_at,
            })
            .collect()
    }

    /// Reload persisted records at startup; anything already expired is
    /// skipped.
    pub fn load(&mut self, records: Vec<BbsRecord>, now: Timestamp) {
        for record in records {
            if record.expires_at <= now {
                continue;
            }
            self.publish(record.msg, now);
        }
    }

    /// Test hook: recompute totals from scratch and compare.
    #[cfg(test)]
    fn totals_consistent(&self) -> bool {
        let count = self.msgs.len() as u64;
        let bytes: u64 = self.msgs.values().map(|s| s.msg.payload.len() as u64).sum();
        self.totals == BbsTotals { count, bytes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETENTION: u64 = 3600 * 12;

    fn msg(channel: u64, posted_s: u64, payload: &[u8]) -> BbsMessage {
        BbsMessage {
            channel,
            timestamp: Timestamp::new(posted_s),
            payload: payload.to_vec(),
        }
    }

    fn replicator() -> BbsReplicator {
        BbsReplicator::new(1000, 1 << 20, RETENTION)
    }

    #[test]
    fn publish_stores_and_announces_to_subscribers() {
        let mut bbs = replicator();
        bbs.subscribe(PeerId(1), 7, Timestamp::EPOCH);
        bbs.subscribe(PeerId(2), 7, Timestamp::EPOCH);
        bbs.subscribe(PeerId(3), 8, Timestamp::EPOCH);

        match bbs.publish(msg(7, 100, b"hello"), Timestamp::new(100)) {
            PublishOutcome::Stored {
                id, subscribers, ..
            } => {
                assert!(bbs.contains(&id));
                assert_eq!(subscribers, vec![PeerId(1), PeerId(2)]);
            }
            other => panic!("expected Stored, got {:?}", other),
        }
        assert!(bbs.totals_consistent());
    }

    #[test]
    fn duplicate_publish_leaves_store_unchanged() {
        let mut bbs = replicator();
        bbs.publish(msg(7, 100, b"hello"), Timestamp::new(100));
        let totals = bbs.totals();
        assert_eq!(
            bbs.publish(msg(7, 100, b"hello"), Timestamp::new(101)),
            PublishOutcome::Duplicate
        );
        assert_eq!(bbs.totals(), totals);
    }

    #[test]
    fn expired_on_arrival_is_rejected() {
        let mut bbs = replicator();
        let now = Timestamp::new(100 + RETENTION);
        assert_eq!(bbs.publish(msg(7, 100, b"x"), now), PublishOutcome::Expired);
        assert_eq!(bbs.totals(), BbsTotals::default());
    }

    #[test]
    fn oversized_payload_rejected() {
        let mut bbs = replicator();
        let big = vec![0u8; MAX_BBS_MSG_SIZE + 1];
        assert_eq!(
            bbs.publish(msg(7, 100, &big), Timestamp::new(100)),
            PublishOutcome::TooLarge
        );
    }

    #[test]
    fn byte_limit_evicts_oldest_first() {
        let mut bbs = BbsReplicator::new(1000, 10, RETENTION);
        let first = bbs.publish(msg(1, 100, b"aaaa"), Timestamp::new(100));
        let PublishOutcome::Stored { id: first_id, .. } = first else {
            panic!("expected Stored");
        };
        bbs.publish(msg(1, 200, b"bbbb"), Timestamp::new(200));

        // 4 + 4 stored; 4 more exceeds 10 → the oldest goes.
        match bbs.publish(msg(1, 300, b"cccc"), Timestamp::new(300)) {
            PublishOutcome::Stored { evicted, .. } => assert_eq!(evicted, vec![first_id]),
            other => panic!("expected Stored, got {:?}", other),
        }
        assert_eq!(bbs.totals().bytes, 8);
        assert!(bbs.totals_consistent());
    }

    #[test]
    fn count_limit_enforced() {
        let mut bbs = BbsReplicator::new(2, 1 << 20, RETENTION);
        bbs.publish(msg(1, 100, b"a"), Timestamp::new(100));
        bbs.publish(msg(1, 101, b"b"), Timestamp::new(101));
        match bbs.publish(msg(1, 102, b"c"), Timestamp::new(102)) {
            PublishOutcome::Stored { evicted, .. } => assert_eq!(evicted.len(), 1),
            other => panic!("expected Stored, got {:?}", other),
        }
        assert_eq!(bbs.totals().count, 2);
    }

    #[test]
    fn never_fitting_message_is_limits_exceeded() {
        let mut bbs = BbsReplicator::new(1000, 3, RETENTION);
        assert_eq!(
            bbs.publish(msg(1, 100, b"toolong"), Timestamp::new(100)),
            PublishOutcome::LimitsExceeded
        );
    }

    #[test]
    fn cleanup_removes_expired_and_decrements_totals() {
        let mut bbs = replicator();
        bbs.publish(msg(7, 100, b"old"), Timestamp::new(100));
        bbs.publish(msg(7, 5000, b"new"), Timestamp::new(5000));

        let removed = bbs.cleanup(Timestamp::new(100 + RETENTION));
        assert_eq!(removed.len(), 1);
        assert_eq!(bbs.totals().count, 1);
        assert!(bbs.totals_consistent());

        // nothing more due
        assert!(bbs.cleanup(Timestamp::new(100 + RETENTION)).is_empty());
    }

    #[test]
    fn subscribe_returns_backlog_from_cursor() {
        let mut bbs = replicator();
        bbs.publish(msg(7, 100, b"one"), Timestamp::new(100));
        bbs.publish(msg(7, 200, b"two"), Timestamp::new(200));
        bbs.publish(msg(8, 150, b"other-channel"), Timestamp::new(150));

        let backlog = bbs.subscribe(PeerId(1), 7, Timestamp::new(150));
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0], bbs_msg_id(&msg(7, 200, b"two")));

        // Idempotent: same answer, no duplicate subscription state.
        let again = bbs.subscribe(PeerId(1), 7, Timestamp::new(150));
        assert_eq!(again, backlog);
        assert_eq!(bbs.subscribers(7), vec![PeerId(1)]);
    }

    #[test]
    fn unsubscribe_is_noop_when_absent() {
        let mut bbs = replicator();
        bbs.unsubscribe(PeerId(1), 7); // never subscribed — fine
        bbs.subscribe(PeerId(1), 7, Timestamp::EPOCH);
        bbs.unsubscribe(PeerId(1), 7);
        assert!(bbs.subscribers(7).is_empty());
        bbs.unsubscribe(PeerId(1), 7); // again — still fine
    }

    #[test]
    fn drop_peer_clears_both_indexes() {
        let mut bbs = replicator();
        bbs.subscribe(PeerId(1), 7, Timestamp::EPOCH);
        bbs.subscribe(PeerId(1), 8, Timestamp::EPOCH);
        bbs.subscribe(PeerId(2), 7, Timestamp::EPOCH);

        bbs.drop_peer(PeerId(1));
        assert_eq!(bbs.subscribers(7), vec![PeerId(2)]);
        assert!(bbs.subscribers(8).is_empty());
        assert!(bbs.channels_of(PeerId(1)).is_empty());
    }

    #[test]
    fn reset_sync_backlog_spans_subscribed_channels() {
        let mut bbs = replicator();
        bbs.subscribe(PeerId(1), 7, Timestamp::EPOCH);
        bbs.subscribe(PeerId(1), 8, Timestamp::EPOCH);
        bbs.publish(msg(7, 100, b"a"), Timestamp::new(100));
        bbs.publish(msg(8, 110, b"b"), Timestamp::new(110));
        bbs.publish(msg(9, 120, b"c"), Timestamp::new(120));

        let backlog = bbs.backlog_for_peer(PeerId(1), Timestamp::EPOCH);
        assert_eq!(backlog.len(), 2);
    }

    #[test]
    fn load_skips_expired_records() {
        let mut bbs = replicator();
        bbs.publish(msg(7, 100, b"a"), Timestamp::new(100));
        bbs.publish(msg(7, 9000, b"b"), Timestamp::new(9000));
        let records = bbs.records();

        let mut restored = replicator();
        restored.load(records, Timestamp::new(100 + RETENTION));
        assert_eq!(restored.totals().count, 1);
        assert!(restored.totals_consistent());
    }
}
