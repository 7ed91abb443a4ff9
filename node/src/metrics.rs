//! Prometheus metrics for the VEIL node.

use prometheus::{
    register_int_counter_with_registry, register_int_gauge_with_registry, IntCounter, IntGauge,
    Opts, Registry,
};

/// Central collection of node-level Prometheus metrics.
pub struct NodeMetrics {
    /// The registry that owns every metric below.
    pub registry: Registry,

    // ── Counters ────────────────────────────────────────────────────────
    /// Headers accepted by the Processor.
    pub headers_applied: IntCounter,
    /// Block bodies accepted by the Processor.
    pub bodies_applied: IntCounter,
    /// Transactions received from peers or locally.
    pub txs_received: IntCounter,
    /// Transactions admitted to a pool (stem or fluff).
    pub txs_accepted: IntCounter,
    /// Fetch-task timeouts.
    pub task_timeouts: IntCounter,
    /// Peers disconnected for protocol violations.
    pub peers_dropped: IntCounter,

    // ── Gauges ──────────────────────────────────────────────────────────
    /// Live peer sessions.
    pub peer_count: IntGauge,
    /// Fluff pool size (transactions).
    pub mempool_count: IntGauge,
    /// Fluff pool size (weight bytes).
    pub mempool_bytes: IntGauge,
    /// Stem pool size.
    pub stem_count: IntGauge,
    /// Stored BBS messages.
    pub bbs_count: IntGauge,
    /// Stored BBS bytes.
    pub bbs_bytes: IntGauge,
    /// Weighted sync progress numerator/denominator.
    pub sync_done: IntGauge,
    pub sync_total: IntGauge,
}

impl NodeMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        macro_rules! counter {
            ($name:expr, $help:expr) => {
                register_int_counter_with_registry!(Opts::new($name, $help), registry)
                    .expect(concat!("register ", $name))
            };
        }
        macro_rules! gauge {
            ($name:expr, $help:expr) => {
                register_int_gauge_with_registry!(Opts::new($name, $help), registry)
                    .expect(concat!("register ", $name))
            };
        }

        let headers_applied = counter!("veil_headers_applied_total", "Headers accepted");
        let bodies_applied = counter!("veil_bodies_applied_total", "Bodies accepted");
        let txs_received = counter!("veil_txs_received_total", "Transactions received");
        let txs_accepted = counter!("veil_txs_accepted_total", "Transactions admitted");
        let task_timeouts = counter!("veil_task_timeouts_total", "Fetch-task timeouts");
        let peers_dropped = counter!(
            "veil_peers_dropped_total",
            "Peers dropped for protocol violations"
        );
        let peer_count = gauge!("veil_peer_count", "Live peer sessions");
        let mempool_count = gauge!("veil_mempool_count", "Fluff pool transactions");
        let mempool_bytes = gauge!("veil_mempool_bytes", "Fluff pool weight bytes");
        let stem_count = gauge!("veil_stem_count", "Stem pool transactions");
        let bbs_count = gauge!("veil_bbs_count", "Stored BBS messages");
        let bbs_bytes = gauge!("veil_bbs_bytes", "Stored BBS bytes");
        let sync_done = gauge!("veil_sync_done", "Weighted sync progress done");
        let sync_total = gauge!("veil_sync_total", "Weighted sync progress total");

        Self {
            registry,
            headers_applied,
            bodies_applied,
            txs_received,
            txs_accepted,
            task_timeouts,
            peers_dropped,
            peer_count,
            mempool_count,
            mempool_bytes,
            stem_count,
            bbs_count,
            bbs_bytes,
            sync_done,
            sync_total,
        }
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_cleanly() {
        let metrics = NodeMetrics::new();
        metrics.txs_received.inc();
        metrics.peer_count.set(3);
        assert_eq!(metrics.txs_received.get(), 1);
        assert_eq!(metrics.peer_count.get(), 3);
        // All families present in the owned registry.
        assert!(metrics.registry.gather().len() >= 10);
    }
}
