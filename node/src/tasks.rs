//! Fetch-task registry.
//!
//! A task is an outstanding request for a header pack or a block body,
//! keyed by `(block-id, is-body)`. Each key exists at most once; a task is
//! either on the unassigned FIFO or bound to exactly one peer's queue, and
//! that ownership moves atomically through the registry's methods. Global
//! in-flight counters enforce the header-pack and body request caps.

use std::collections::{HashMap, VecDeque};

use veil_types::BlockId;

use crate::peer::PeerId;
use crate::processor::FastSyncWindow;

/// Task identity: the block being fetched and whether we want the body
/// (`true`) or a header pack ending at it (`false`).
pub type TaskKey = (BlockId, bool);

/// Where a released task re-enters the unassigned list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// Retry soon (timeouts).
    Front,
    /// Preserve original order (peer teardown).
    Back,
}

/// An outstanding fetch task.
#[derive(Clone, Debug)]
pub struct Task {
    pub key: TaskKey,
    /// Cleared when the target is no longer needed; such tasks are dropped
    /// at the next ownership transition instead of being reassigned.
    pub needed: bool,
    /// Number of headers/blocks this request covers (packs > 1).
    pub count: u32,
    pub assigned: Option<PeerId>,
    /// Set iff `assigned` is set.
    pub assigned_at_ms: Option<u64>,
    /// The tip this fetch ultimately works toward.
    pub target_tip: BlockId,
    /// Fast-sync window at the moment the task was created, if body
    /// fetching runs in fast-sync mode.
    pub window: Option<FastSyncWindow>,
}

impl Task {
    pub fn is_body(&self) -> bool {
        self.key.1
    }
}

/// The registry owning every task not currently bound to a peer.
pub struct TaskRegistry {
    tasks: HashMap<TaskKey, Task>,
    unassigned: VecDeque<TaskKey>,
    in_flight_hdr: u32,
    in_flight_body: u32,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            unassigned: VecDeque::new(),
            in_flight_hdr: 0,
            in_flight_body: 0,
        }
    }

    // -- Creation --------------------------------------------------------

    /// Create a task unless one with this key already exists. Returns
    /// whether a new task was created.
    pub fn request(
        &mut self,
        key: TaskKey,
        count: u32,
        target_tip: BlockId,
        window: Option<FastSyncWindow>,
    ) -> bool {
        if self.tasks.contains_key(&key) {
            return false;
        }
        self.tasks.insert(
            key,
            Task {
                key,
                needed: true,
                count,
                assigned: None,
                assigned_at_ms: None,
                target_tip,
                window,
            },
        );
        self.unassigned.push_back(key);
        true
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn get(&self, key: &TaskKey) -> Option<&Task> {
        self.tasks.get(key)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Number of tasks waiting for a peer.
    pub fn unassigned_len(&self) -> usize {
        self.unassigned.len()
    }

    /// Snapshot of the unassigned keys in FIFO order.
    pub fn unassigned_keys(&self) -> Vec<TaskKey> {
        self.unassigned.iter().copied().collect()
    }

    // -- Global caps -----------------------------------------------------

    pub fn in_flight_hdr(&self) -> u32 {
        self.in_flight_hdr
    }

    pub fn in_flight_body(&self) -> u32 {
        self.in_flight_body
    }

    /// Whether starting a task of this kind stays within the global caps.
    pub fn under_global_cap(&self, is_body: bool, max_hdr: u32, max_body: u32) -> bool {
        if is_body {
            self.in_flight_body < max_body
        } else {
            self.in_flight_hdr < max_hdr
        }
    }

    // -- Ownership transitions -------------------------------------------

    /// Bind an unassigned task to a peer. The caller pushes the key onto
    /// the peer's queue. Returns `false` when the task is gone, no longer
    /// needed, or already bound.
    pub fn assign(&mut self, key: &TaskKey, peer: PeerId, now_ms: u64) -> bool {
        let Some(task) = self.tasks.get_mut(key) else {
            return false;
        };
        if task.assigned.is_some() || !task.needed {
            return false;
        }
        task.assigned = Some(peer);
        task.assigned_at_ms = Some(now_ms);
        self.unassigned.retain(|k| k != key);
        if task.is_body() {
            self.in_flight_body += 1;
        } else {
            self.in_flight_hdr += 1;
        }
        true
    }

    /// Unbind a task from its peer and return it to the unassigned list.
    /// Tasks marked not-needed are deleted instead. The caller removes the
    /// key from the peer's queue.
    pub fn release(&mut self, key: &TaskKey, placement: Placement) {
        let Some(task) = self.tasks.get_mut(key) else {
            return;
        };
        if task.assigned.take().is_some() {
            task.assigned_at_ms = None;
            if task.is_body() {
                self.in_flight_body -= 1;
            } else {
                self.in_flight_hdr -= 1;
            }
        } else {
            // Already unassigned; avoid duplicating the queue entry.
            return;
        }
        if !task.needed {
            self.tasks.remove(key);
            return;
        }
        match placement {
            Placement::Front => self.unassigned.push_front(*key),
            Placement::Back => self.unassigned.push_back(*key),
        }
    }

    /// Remove a finished task entirely. Returns it for inspection.
    pub fn complete(&mut self, key: &TaskKey) -> Option<Task> {
        let task = self.tasks.remove(key)?;
        if task.assigned.is_some() {
            if task.is_body() {
                self.in_flight_body -= 1;
            } else {
                self.in_flight_hdr -= 1;
            }
        } else {
            self.unassigned.retain(|k| k != key);
        }
        Some(task)
    }

    /// Mark a task as no longer needed. Unassigned tasks are dropped at
    /// once; assigned ones are dropped when their peer releases them.
    pub fn cancel(&mut self, key: &TaskKey) {
        let Some(task) = self.tasks.get_mut(key) else {
            return;
        };
        task.needed = false;
        if task.assigned.is_none() {
            self.tasks.remove(key);
            self.unassigned.retain(|k| k != key);
        }
    }

    /// Drop every task working toward a target below `min_height` (the
    /// chain moved past them).
    pub fn cancel_below(&mut self, min_height: u64) {
        let stale: Vec<TaskKey> = self
            .tasks
            .values()
            .filter(|t| t.key.0.height < min_height)
            .map(|t| t.key)
            .collect();
        for key in stale {
            self.cancel(&key);
        }
    }

    /// Invariant check used by tests: the unassigned list plus the given
    /// peer queues partition the task set exactly.
    pub fn validate_partition<'a, I>(&self, peer_queues: I) -> bool
    where
        I: IntoIterator<Item = &'a VecDeque<TaskKey>>,
    {
        let mut seen: HashMap<TaskKey, u32> = HashMap::new();
        for key in &self.unassigned {
            *seen.entry(*key).or_default() += 1;
        }
        for queue in peer_queues {
            for key in queue {
                *seen.entry(*key).or_default() += 1;
            }
        }
        seen.len() == self.tasks.len()
            && seen.values().all(|&n| n == 1)
            && seen.keys().all(|k| self.tasks.contains_key(k))
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_types::BlockHash;

    fn bid(height: u64) -> BlockId {
        BlockId::new(height, BlockHash::new([height as u8; 32]))
    }

    fn key(height: u64, body: bool) -> TaskKey {
        (bid(height), body)
    }

    #[test]
    fn request_deduplicates_by_key() {
        let mut reg = TaskRegistry::new();
        assert!(reg.request(key(5, false), 10, bid(100), None));
        assert!(!reg.request(key(5, false), 10, bid(100), None));
        // same block, body flag differs — distinct key
        assert!(reg.request(key(5, true), 1, bid(100), None));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn assign_moves_off_unassigned_and_counts() {
        let mut reg = TaskRegistry::new();
        reg.request(key(5, true), 1, bid(100), None);
        assert_eq!(reg.unassigned_len(), 1);

        assert!(reg.assign(&key(5, true), PeerId(1), 1000));
        assert_eq!(reg.unassigned_len(), 0);
        assert_eq!(reg.in_flight_body(), 1);
        assert_eq!(reg.in_flight_hdr(), 0);
        assert_eq!(reg.get(&key(5, true)).unwrap().assigned_at_ms, Some(1000));

        // double-assign refused
        assert!(!reg.assign(&key(5, true), PeerId(2), 1001));
    }

    #[test]
    fn release_front_retries_first() {
        let mut reg = TaskRegistry::new();
        reg.request(key(1, true), 1, bid(100), None);
        reg.request(key(2, true), 1, bid(100), None);
        reg.assign(&key(1, true), PeerId(1), 0);

        reg.release(&key(1, true), Placement::Front);
        assert_eq!(reg.unassigned_keys()[0], key(1, true));
        assert_eq!(reg.in_flight_body(), 0);
        assert!(reg.get(&key(1, true)).unwrap().assigned_at_ms.is_none());
    }

    #[test]
    fn release_back_preserves_order() {
        let mut reg = TaskRegistry::new();
        for h in 1..=3 {
            reg.request(key(h, true), 1, bid(100), None);
        }
        reg.assign(&key(1, true), PeerId(1), 0);
        reg.assign(&key(2, true), PeerId(1), 0);

        // peer teardown: release in original queue order
        reg.release(&key(1, true), Placement::Back);
        reg.release(&key(2, true), Placement::Back);
        assert_eq!(
            reg.unassigned_keys(),
            vec![key(3, true), key(1, true), key(2, true)]
        );
    }

    #[test]
    fn complete_removes_and_uncounts() {
        let mut reg = TaskRegistry::new();
        reg.request(key(1, false), 100, bid(100), None);
        reg.assign(&key(1, false), PeerId(1), 0);
        assert_eq!(reg.in_flight_hdr(), 1);

        let task = reg.complete(&key(1, false)).unwrap();
        assert_eq!(task.count, 100);
        assert_eq!(reg.in_flight_hdr(), 0);
        assert!(reg.is_empty());
    }

    #[test]
    fn cancel_assigned_defers_until_release() {
        let mut reg = TaskRegistry::new();
        reg.request(key(1, true), 1, bid(100), None);
        reg.assign(&key(1, true), PeerId(1), 0);

        reg.cancel(&key(1, true));
        assert!(reg.contains(&key(1, true)));

        reg.release(&key(1, true), Placement::Front);
        assert!(!reg.contains(&key(1, true)));
        assert_eq!(reg.unassigned_len(), 0);
    }

    #[test]
    fn cancel_unassigned_drops_immediately() {
        let mut reg = TaskRegistry::new();
        reg.request(key(1, true), 1, bid(100), None);
        reg.cancel(&key(1, true));
        assert!(reg.is_empty());
        assert_eq!(reg.unassigned_len(), 0);
    }

    #[test]
    fn cancel_below_drops_stale_targets() {
        let mut reg = TaskRegistry::new();
        reg.request(key(5, true), 1, bid(100), None);
        reg.request(key(50, true), 1, bid(100), None);
        reg.cancel_below(10);
        assert!(!reg.contains(&key(5, true)));
        assert!(reg.contains(&key(50, true)));
    }

    #[test]
    fn global_caps() {
        let mut reg = TaskRegistry::new();
        reg.request(key(1, false), 10, bid(100), None);
        reg.request(key(2, true), 1, bid(100), None);
        reg.assign(&key(1, false), PeerId(1), 0);

        assert!(!reg.under_global_cap(false, 1, 18));
        assert!(reg.under_global_cap(true, 1, 18));
    }

    #[test]
    fn partition_invariant_holds() {
        let mut reg = TaskRegistry::new();
        for h in 1..=4 {
            reg.request(key(h, true), 1, bid(100), None);
        }
        let mut queue = VecDeque::new();
        reg.assign(&key(1, true), PeerId(1), 0);
        queue.push_back(key(1, true));
        reg.assign(&key(2, true), PeerId(1), 0);
        queue.push_back(key(2, true));

        assert!(reg.validate_partition([&queue]));

        // a key in two places violates the partition
        let rogue: VecDeque<TaskKey> = vec![key(3, true)].into();
        assert!(!reg.validate_partition([&queue, &rogue]));
    }
}
