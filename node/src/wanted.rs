//! Wanted-set registry.
//!
//! A wanted set tracks hashes the node has advertised interest in (via a
//! `Get*` request) and expects to receive within a timeout. Insertion order
//! is a FIFO by advertisement time; a key index deduplicates requests.
//! Removal is lazy: a removed key stays in the FIFO until it reaches the
//! head, where it is skipped.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// Deduplicated set of outstanding "I want this hash" requests.
pub struct WantedSet<K> {
    queue: VecDeque<(K, u64)>,
    set: HashSet<K>,
    timeout_ms: u64,
}

impl<K: Eq + Hash + Copy> WantedSet<K> {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            set: HashSet::new(),
            timeout_ms,
        }
    }

    /// Register interest in `key`. Returns `false` if it was already
    /// wanted (no new request should be sent).
    pub fn add(&mut self, key: K, now_ms: u64) -> bool {
        if !self.set.insert(key) {
            return false;
        }
        self.queue.push_back((key, now_ms));
        true
    }

    /// Satisfy or cancel interest in `key`. Returns `true` if it was
    /// wanted.
    pub fn remove(&mut self, key: &K) -> bool {
        self.set.remove(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.set.contains(key)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Drop queue entries whose keys were already removed, so the head is
    /// live.
    fn skip_stale(&mut self) {
        while let Some((key, _)) = self.queue.front() {
            if self.set.contains(key) {
                break;
            }
            self.queue.pop_front();
        }
    }

    /// The deadline of the oldest live item, i.e. when the set's timer
    /// should next fire.
    pub fn next_deadline_ms(&mut self) -> Option<u64> {
        self.skip_stale();
        self.queue
            .front()
            .map(|(_, advertised)| advertised + self.timeout_ms)
    }

    /// Pop every item whose deadline has passed.
    pub fn expire(&mut self, now_ms: u64) -> Vec<K> {
        let mut expired = Vec::new();
        loop {
            self.skip_stale();
            match self.queue.front() {
                Some(&(key, advertised)) if advertised + self.timeout_ms <= now_ms => {
                    self.queue.pop_front();
                    self.set.remove(&key);
                    expired.push(key);
                }
                _ => break,
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_deduplicated() {
        let mut w = WantedSet::new(1000);
        assert!(w.add(1u32, 0));
        assert!(!w.add(1u32, 10));
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn expiry_in_fifo_order() {
        let mut w = WantedSet::new(1000);
        w.add(1u32, 0);
        w.add(2u32, 100);
        w.add(3u32, 2000);

        assert_eq!(w.expire(1100), vec![1, 2]);
        assert_eq!(w.len(), 1);
        assert!(w.contains(&3));
    }

    #[test]
    fn deadline_tracks_live_head() {
        let mut w = WantedSet::new(1000);
        w.add(1u32, 0);
        w.add(2u32, 500);
        assert_eq!(w.next_deadline_ms(), Some(1000));

        // Satisfying the head moves the deadline to the next live item.
        w.remove(&1);
        assert_eq!(w.next_deadline_ms(), Some(1500));
    }

    #[test]
    fn removed_items_never_expire() {
        let mut w = WantedSet::new(1000);
        w.add(1u32, 0);
        w.remove(&1);
        assert!(w.expire(10_000).is_empty());
        assert!(w.is_empty());
    }

    #[test]
    fn re_add_after_remove_uses_new_deadline() {
        let mut w = WantedSet::new(1000);
        w.add(1u32, 0);
        w.remove(&1);
        assert!(w.add(1u32, 5000));
        assert_eq!(w.expire(1001), Vec::<u32>::new());
        assert_eq!(w.expire(6000), vec![1]);
    }

    #[test]
    fn empty_set_has_no_deadline() {
        let mut w: WantedSet<u32> = WantedSet::new(1000);
        assert_eq!(w.next_deadline_ms(), None);
    }
}
