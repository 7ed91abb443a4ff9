//! Persistent peer cache storage trait.
//!
//! Stores recently seen peers so the node can reconnect on restart without
//! relying solely on the configured connect list.

use std::net::SocketAddr;

use crate::StoreError;

/// Trait for persisting address-book entries across restarts.
///
/// Entries are `(address, rating, last_seen_secs)`.
pub trait PeerStore {
    /// Insert or update a peer record.
    fn put_peer(&self, addr: SocketAddr, rating: u32, last_seen_s: u64) -> Result<(), StoreError>;

    /// Remove a peer from the cache.
    fn delete_peer(&self, addr: &SocketAddr) -> Result<(), StoreError>;

    /// All cached peers.
    fn iter_peers(&self) -> Result<Vec<(SocketAddr, u32, u64)>, StoreError>;

    /// Remove all peers last seen before `cutoff_s`. Returns how many were
    /// removed.
    fn purge_older_than(&self, cutoff_s: u64) -> Result<usize, StoreError>;
}
