//! In-memory store implementation.
//!
//! Backs tests and fresh dev-mode nodes. All three store traits are served
//! by one [`MemoryStore`] guarded by a single mutex; contention is not a
//! concern at test scale.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Mutex;

use veil_types::{BbsMsgId, BlockHeader, BlockId, Height};

use crate::bbs::{BbsRecord, BbsStore};
use crate::chain::ChainStore;
use crate::peer::PeerStore;
use crate::StoreError;

#[derive(Default)]
struct Inner {
    blocks: BTreeMap<Height, (BlockHeader, Option<Vec<u8>>)>,
    bbs: HashMap<BbsMsgId, BbsRecord>,
    peers: HashMap<SocketAddr, (u32, u64)>,
}

/// Everything-in-RAM store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned mutex means a panic mid-write; the store is test-grade,
        // propagate as a backend error by unwrapping into the panic.
        self.inner.lock().expect("memory store poisoned")
    }
}

impl ChainStore for MemoryStore {
    fn tip(&self) -> Result<Option<BlockId>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .blocks
            .iter()
            .next_back()
            .map(|(_, (h, _))| h.id()))
    }

    fn save_block(&self, header: &BlockHeader, body: Option<&[u8]>) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner
            .blocks
            .insert(header.height, (header.clone(), body.map(|b| b.to_vec())));
        Ok(())
    }

    fn header_at(&self, height: Height) -> Result<Option<BlockHeader>, StoreError> {
        Ok(self.lock().blocks.get(&height).map(|(h, _)| h.clone()))
    }

    fn body_at(&self, height: Height) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .lock()
            .blocks
            .get(&height)
            .and_then(|(_, b)| b.clone()))
    }

    fn rollback_to(&self, height: Height) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.blocks.retain(|&h, _| h <= height);
        Ok(())
    }

    fn enumerate(&self, min: Height, max: Height) -> Result<Vec<BlockId>, StoreError> {
        Ok(self
            .lock()
            .blocks
            .range(min..=max)
            .map(|(_, (h, _))| h.id())
            .collect())
    }
}

impl BbsStore for MemoryStore {
    fn save_msg(&self, record: &BbsRecord) -> Result<(), StoreError> {
        self.lock().bbs.insert(record.id, record.clone());
        Ok(())
    }

    fn get_msg(&self, id: &BbsMsgId) -> Result<Option<BbsRecord>, StoreError> {
        Ok(self.lock().bbs.get(id).cloned())
    }

    fn delete_msg(&self, id: &BbsMsgId) -> Result<(), StoreError> {
        self.lock().bbs.remove(id);
        Ok(())
    }

    fn all_msgs(&self) -> Result<Vec<BbsRecord>, StoreError> {
        Ok(self.lock().bbs.values().cloned().collect())
    }
}

impl PeerStore for MemoryStore {
    fn put_peer(&self, addr: SocketAddr, rating: u32, last_seen_s: u64) -> Result<(), StoreError> {
        self.lock().peers.insert(addr, (rating, last_seen_s));
        Ok(())
    }

    fn delete_peer(&self, addr: &SocketAddr) -> Result<(), StoreError> {
        self.lock().peers.remove(addr);
        Ok(())
    }

    fn iter_peers(&self) -> Result<Vec<(SocketAddr, u32, u64)>, StoreError> {
        Ok(self
            .lock()
            .peers
            .iter()
            .map(|(&addr, &(rating, seen))| (addr, rating, seen))
            .collect())
    }

    fn purge_older_than(&self, cutoff_s: u64) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let before = inner.peers.len();
        inner.peers.retain(|_, &mut (_, seen)| seen >= cutoff_s);
        Ok(before - inner.peers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_messages::BbsMessage;
    use veil_types::{BlockHash, ChainWork, Timestamp};

    fn header(height: Height) -> BlockHeader {
        BlockHeader {
            height,
            prev: BlockHash::new([height as u8; 32]),
            chain_work: ChainWork(height as u128 * 10),
            timestamp: Timestamp::new(height),
            pow_nonce: 0,
        }
    }

    #[test]
    fn chain_tip_follows_highest_block() {
        let store = MemoryStore::new();
        assert!(store.tip().unwrap().is_none());

        store.save_block(&header(1), None).unwrap();
        store.save_block(&header(2), Some(b"body")).unwrap();
        assert_eq!(store.tip().unwrap().unwrap().height, 2);
        assert_eq!(store.body_at(2).unwrap().unwrap(), b"body");
    }

    #[test]
    fn rollback_drops_above_height() {
        let store = MemoryStore::new();
        for h in 1..=5 {
            store.save_block(&header(h), None).unwrap();
        }
        store.rollback_to(3).unwrap();
        assert_eq!(store.tip().unwrap().unwrap().height, 3);
        assert!(store.header_at(4).unwrap().is_none());
    }

    #[test]
    fn enumerate_is_ascending_and_bounded() {
        let store = MemoryStore::new();
        for h in 1..=5 {
            store.save_block(&header(h), None).unwrap();
        }
        let ids = store.enumerate(2, 4).unwrap();
        let heights: Vec<Height> = ids.iter().map(|id| id.height).collect();
        assert_eq!(heights, vec![2, 3, 4]);
    }

    #[test]
    fn bbs_save_get_delete() {
        let store = MemoryStore::new();
        let rec = BbsRecord {
            id: BbsMsgId::new([1; 32]),
            msg: BbsMessage {
                channel: 3,
                timestamp: Timestamp::new(100),
                payload: vec![1, 2, 3],
            },
            expires_at: Timestamp::new(200),
        };
        store.save_msg(&rec).unwrap();
        assert_eq!(store.get_msg(&rec.id).unwrap().unwrap(), rec);
        store.delete_msg(&rec.id).unwrap();
        assert!(store.get_msg(&rec.id).unwrap().is_none());
    }

    #[test]
    fn peer_cache_purge() {
        let store = MemoryStore::new();
        let a: SocketAddr = "1.1.1.1:1".parse().unwrap();
        let b: SocketAddr = "2.2.2.2:2".parse().unwrap();
        store.put_peer(a, 1024, 100).unwrap();
        store.put_peer(b, 1024, 500).unwrap();
        assert_eq!(store.purge_older_than(200).unwrap(), 1);
        assert_eq!(store.iter_peers().unwrap().len(), 1);
    }
}
