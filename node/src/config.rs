//! Node configuration with TOML file support.
//!
//! Every tuning knob lives here, immutable after construction. The nested
//! sections mirror the subsystems they configure; each field has a serde
//! default so a partial TOML file (or an empty one) yields a working dev
//! node.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::NodeError;

/// Configuration for a VEIL node.
///
/// Can be loaded from a TOML file via [`NodeConfig::from_toml_file`] or
/// built programmatically (e.g. for tests).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// P2P listen address.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// UDP beacon port; 0 means use the listen port.
    #[serde(default)]
    pub beacon_port: u16,

    /// Beacon broadcast period in milliseconds; 0 disables the beacon.
    #[serde(default = "default_beacon_period_ms")]
    pub beacon_period_ms: u64,

    /// Peers to dial at startup, in addition to the persisted peer cache.
    #[serde(default)]
    pub connect: Vec<SocketAddr>,

    /// Maximum number of address-book records.
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// Target number of live outbound connections.
    #[serde(default = "default_target_connections")]
    pub target_connections: usize,

    /// Fast-sync horizon: bodies below `tip - horizon` are fetched without
    /// full verification, relying on checkpointed state.
    #[serde(default = "default_horizon")]
    pub horizon: u64,

    /// Global cap on in-flight header-pack requests.
    #[serde(default = "default_max_hdr_packs")]
    pub max_concurrent_hdr_packs: u32,

    /// Global cap on in-flight block/body requests.
    #[serde(default = "default_max_body_requests")]
    pub max_concurrent_body_requests: u32,

    /// Per-peer cap on in-flight header-pack requests.
    #[serde(default = "default_per_peer_hdr")]
    pub per_peer_hdr_packs: u32,

    /// Per-peer cap on in-flight body requests.
    #[serde(default = "default_per_peer_body")]
    pub per_peer_body_requests: u32,

    /// Headers per header-pack request.
    #[serde(default = "default_hdr_pack_size")]
    pub hdr_pack_size: u32,

    /// In `Tip` state, a peer tip this many blocks ahead sends us back to
    /// `HeaderSync` instead of single-block fetches.
    #[serde(default = "default_tip_resync_gap")]
    pub tip_resync_gap: u64,

    /// Fluff pool cap (transaction count).
    #[serde(default = "default_max_pool_txs")]
    pub max_pool_transactions: usize,

    /// Fluff pool cap (total weight bytes).
    #[serde(default = "default_max_pool_bytes")]
    pub max_pool_bytes: usize,

    /// Number of mining threads; 0 disables internal mining.
    #[serde(default)]
    pub mining_threads: usize,

    /// Number of verification worker threads; 0 verifies inline on the
    /// reactor.
    #[serde(default)]
    pub verification_threads: usize,

    /// Log accepted stem transactions.
    #[serde(default = "default_true")]
    pub log_tx_stem: bool,

    /// Log accepted fluff transactions.
    #[serde(default = "default_true")]
    pub log_tx_fluff: bool,

    /// Directory for recovery snapshots, if enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_path: Option<PathBuf>,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub rollback: RollbackConfig,

    #[serde(default)]
    pub bandwidth: BandwidthConfig,

    #[serde(default)]
    pub dandelion: DandelionConfig,

    #[serde(default)]
    pub bbs: BbsConfig,
}

/// Request and maintenance timers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Header / header-pack request timeout.
    #[serde(default = "default_get_state_ms")]
    pub get_state_ms: u64,
    /// Block body request timeout.
    #[serde(default = "default_get_block_ms")]
    pub get_block_ms: u64,
    /// Wanted-transaction fetch timeout.
    #[serde(default = "default_get_tx_ms")]
    pub get_tx_ms: u64,
    /// Wanted-BBS-message fetch timeout.
    #[serde(default = "default_get_bbs_ms")]
    pub get_bbs_ms: u64,
    /// Minimum interval between mining template rebuilds.
    #[serde(default = "default_mining_soft_restart_ms")]
    pub mining_soft_restart_ms: u64,
    /// Peer connection maintenance cadence.
    #[serde(default = "default_peers_update_ms")]
    pub peers_update_ms: u64,
    /// Peer cache flush cadence.
    #[serde(default = "default_peers_flush_ms")]
    pub peers_flush_ms: u64,
    /// Cadence for resending known peer addresses to connected peers.
    #[serde(default = "default_peers_resend_ms")]
    pub peers_resend_ms: u64,
    /// Pong watchdog: disconnect a peer that stays silent this long after
    /// a ping.
    #[serde(default = "default_pong_ms")]
    pub pong_ms: u64,
}

/// Limits on automatic chain rollback.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RollbackConfig {
    /// Automatic rollback depth limit.
    #[serde(default = "default_max_auto_rollback")]
    pub max_auto: u64,
    /// Deeper rollback becomes possible once the current tip is older than
    /// this.
    #[serde(default = "default_rollback_timeout_s")]
    pub timeout_since_tip_s: u64,
}

/// Outbound backpressure thresholds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BandwidthConfig {
    /// Above this many queued outbound bytes a peer is marked chocking and
    /// receives no new tasks.
    #[serde(default = "default_chocking")]
    pub chocking: usize,
    /// Above this many queued outbound bytes the connection is aborted.
    #[serde(default = "default_drown")]
    pub drown: usize,
    /// Response size bound for a single body-pack request.
    #[serde(default = "default_max_body_pack_size")]
    pub max_body_pack_size: usize,
    /// Block count bound for a single body-pack request.
    #[serde(default = "default_max_body_pack_count")]
    pub max_body_pack_count: u32,
}

/// Dandelion relay parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DandelionConfig {
    /// Probability of fluffing at admission, normalized to 16 bits.
    /// 0x0000 never fluffs, 0xFFFF always fluffs.
    #[serde(default = "default_fluff_probability")]
    pub fluff_probability: u16,
    /// Stem timeout range (uniform draw).
    #[serde(default = "default_stem_timeout_min_ms")]
    pub timeout_min_ms: u64,
    #[serde(default = "default_stem_timeout_max_ms")]
    pub timeout_max_ms: u64,
    /// A stem tx not mined within this many blocks of becoming eligible is
    /// force-fluffed.
    #[serde(default = "default_dh_stem_confirm")]
    pub dh_stem_confirm: u64,
    /// How long an aggregating stem waits for merge partners.
    #[serde(default = "default_aggregation_time_ms")]
    pub aggregation_time_ms: u64,
    /// Outputs required before an aggregate is released.
    #[serde(default = "default_outputs_min")]
    pub outputs_min: u32,
    /// Outputs beyond which no further merging happens.
    #[serde(default = "default_outputs_max")]
    pub outputs_max: u32,
    /// Dummy output spend-height range, in blocks above the current tip.
    /// `hi = 0` disables dummy creation.
    #[serde(default = "default_dummy_lifetime_lo")]
    pub dummy_lifetime_lo: u64,
    #[serde(default = "default_dummy_lifetime_hi")]
    pub dummy_lifetime_hi: u64,
}

/// Bulletin-board replication limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BbsConfig {
    /// Message retention window.
    #[serde(default = "default_bbs_timeout_s")]
    pub message_timeout_s: u64,
    /// Expired-message sweep cadence.
    #[serde(default = "default_bbs_cleanup_ms")]
    pub cleanup_period_ms: u64,
    /// Stored message count limit; 0 disables BBS replication.
    #[serde(default = "default_bbs_limit_count")]
    pub limit_count: u64,
    /// Stored message byte limit.
    #[serde(default = "default_bbs_limit_bytes")]
    pub limit_bytes: u64,
}

impl BbsConfig {
    pub fn is_enabled(&self) -> bool {
        self.limit_count > 0
    }
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_listen() -> SocketAddr {
    "0.0.0.0:31744".parse().expect("static addr")
}

fn default_beacon_period_ms() -> u64 {
    500
}

fn default_max_peers() -> usize {
    1000
}

fn default_target_connections() -> usize {
    16
}

fn default_horizon() -> u64 {
    1440
}

fn default_max_hdr_packs() -> u32 {
    4
}

fn default_max_body_requests() -> u32 {
    18
}

fn default_per_peer_hdr() -> u32 {
    1
}

fn default_per_peer_body() -> u32 {
    6
}

fn default_hdr_pack_size() -> u32 {
    2048
}

fn default_tip_resync_gap() -> u64 {
    8
}

fn default_max_pool_txs() -> usize {
    100_000
}

fn default_max_pool_bytes() -> usize {
    512 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_get_state_ms() -> u64 {
    5_000
}

fn default_get_block_ms() -> u64 {
    30_000
}

fn default_get_tx_ms() -> u64 {
    5_000
}

fn default_get_bbs_ms() -> u64 {
    10_000
}

fn default_mining_soft_restart_ms() -> u64 {
    1_000
}

fn default_peers_update_ms() -> u64 {
    1_000
}

fn default_peers_flush_ms() -> u64 {
    60_000
}

fn default_peers_resend_ms() -> u64 {
    600_000
}

fn default_pong_ms() -> u64 {
    60_000
}

fn default_max_auto_rollback() -> u64 {
    60
}

fn default_rollback_timeout_s() -> u64 {
    3600
}

fn default_chocking() -> usize {
    1024 * 1024
}

fn default_drown() -> usize {
    20 * 1024 * 1024
}

fn default_max_body_pack_size() -> usize {
    5 * 1024 * 1024
}

fn default_max_body_pack_count() -> u32 {
    3000
}

fn default_fluff_probability() -> u16 {
    0x1999 // ≈ 0.1
}

fn default_stem_timeout_min_ms() -> u64 {
    20_000
}

fn default_stem_timeout_max_ms() -> u64 {
    50_000
}

fn default_dh_stem_confirm() -> u64 {
    5
}

fn default_aggregation_time_ms() -> u64 {
    10_000
}

fn default_outputs_min() -> u32 {
    5
}

fn default_outputs_max() -> u32 {
    40
}

fn default_dummy_lifetime_lo() -> u64 {
    720
}

fn default_dummy_lifetime_hi() -> u64 {
    1440 * 7
}

fn default_bbs_timeout_s() -> u64 {
    3600 * 12
}

fn default_bbs_cleanup_ms() -> u64 {
    3600 * 1000
}

fn default_bbs_limit_count() -> u64 {
    20_000_000
}

fn default_bbs_limit_bytes() -> u64 {
    5 * 1024 * 1024 * 1024
}

// ── Impl ───────────────────────────────────────────────────────────────

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &std::path::Path) -> Result<Self, NodeError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| NodeError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, NodeError> {
        toml::from_str(s).map_err(|e| NodeError::Config(e.to_string()))
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        // An empty TOML document is exactly "all defaults".
        Self::from_toml_str("").expect("empty config parses")
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config parses")
    }
}

impl Default for RollbackConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config parses")
    }
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config parses")
    }
}

impl Default for DandelionConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config parses")
    }
}

impl Default for BbsConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config parses")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_defaults() {
        let cfg = NodeConfig::from_toml_str("").expect("should parse");
        assert_eq!(cfg.max_concurrent_body_requests, 18);
        assert_eq!(cfg.bandwidth.chocking, 1024 * 1024);
        assert_eq!(cfg.dandelion.fluff_probability, 0x1999);
        assert_eq!(cfg.rollback.max_auto, 60);
        assert!(cfg.bbs.is_enabled());
    }

    #[test]
    fn partial_toml_overrides() {
        let toml = r#"
            max_peers = 10

            [dandelion]
            fluff_probability = 0

            [bandwidth]
            drown = 1048576
        "#;
        let cfg = NodeConfig::from_toml_str(toml).expect("should parse");
        assert_eq!(cfg.max_peers, 10);
        assert_eq!(cfg.dandelion.fluff_probability, 0);
        assert_eq!(cfg.bandwidth.drown, 1024 * 1024);
        // untouched sections keep defaults
        assert_eq!(cfg.bandwidth.chocking, 1024 * 1024);
        assert_eq!(cfg.timeouts.get_block_ms, 30_000);
    }

    #[test]
    fn zero_bbs_count_disables_replication() {
        let cfg = NodeConfig::from_toml_str("[bbs]\nlimit_count = 0\n").unwrap();
        assert!(!cfg.bbs.is_enabled());
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = NodeConfig::from_toml_file(std::path::Path::new("/nonexistent/veil.toml"));
        assert!(matches!(err, Err(NodeError::Config(_))));
    }

    #[test]
    fn config_round_trips_through_toml() {
        let cfg = NodeConfig::default();
        let s = toml::to_string_pretty(&cfg).unwrap();
        let parsed = NodeConfig::from_toml_str(&s).unwrap();
        assert_eq!(parsed.listen, cfg.listen);
        assert_eq!(parsed.dandelion.timeout_max_ms, cfg.dandelion.timeout_max_ms);
    }
}
