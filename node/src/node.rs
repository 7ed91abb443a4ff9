//! The node reactor.
//!
//! One [`Node`] owns every piece of mutable state and processes one
//! [`NodeEvent`] at a time with an injected clock (`now_ms`). Sockets,
//! timers, the beacon, mining threads, and the verification pool all live
//! outside and communicate through events in and [`NodeAction`]s out.
//! Messages from a single peer arrive in order; Processor events are
//! handled in the order the Processor returns them; a task's completion is
//! processed before any later message from the same peer — all of which
//! follows from the reactor being a single sequential dispatcher.

use std::collections::HashMap;
use std::net::SocketAddr;

use ed25519_dalek::SigningKey;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use veil_messages::{Authentication, BbsMessage, ByeReason, LoginFlags, PeerAddress, WireMessage};
use veil_network::{PeerManager, PenaltyReason, RATING_INITIAL};
use veil_protocol::{encoded_len, sign_nonce, verify_authentication, HandshakeNonce};
use veil_types::{
    BbsMsgId, BlockHeader, BlockId, ContextHash, Height, NodeId, Timestamp, Transaction,
    TxFingerprint, TxOutput,
};

use crate::bbs::{BbsReplicator, PublishOutcome, MAX_BBS_MSG_SIZE};
use crate::config::NodeConfig;
use crate::events::{NodeAction, NodeCallbacks, NodeEvent, SyncError, TimerKind};
use crate::metrics::NodeMetrics;
use crate::miner::{MinerCoordinator, SolutionOutcome};
use crate::peer::{PeerFlags, PeerId, PeerSession, DISCONNECT_AFTER_TIMEOUTS};
use crate::processor::{DataStatus, Processor, ProcessorEvent, ProofQuery, TxStatus};
use crate::sync::{SyncController, SyncProgress, SyncState, TipGapAction};
use crate::tasks::{Placement, TaskRegistry};
use crate::txpool::{DependentPool, FluffInsert, FluffPool, StemEntry, StemPool};
use crate::wanted::WantedSet;
use crate::workers::{check_header_chain, JobKind, JobOutcome, WorkerPool};

/// Peer addresses sent per `PeersResend` round.
const PEERS_RESEND_BATCH: usize = 8;
/// Weight budget for a block template.
const TEMPLATE_MAX_WEIGHT: usize = 1024 * 1024;

/// Why a stem entry leaves the stem pool. Only used for logging.
#[derive(Clone, Copy, Debug)]
enum FluffReason {
    Timeout,
    Aggregated,
    ConfirmDeadline,
    RelayPeerLost,
}

/// The full-node orchestrator.
pub struct Node<P: Processor> {
    cfg: NodeConfig,
    processor: P,
    callbacks: NodeCallbacks,
    metrics: NodeMetrics,
    identity: SigningKey,
    rng: StdRng,

    peers: HashMap<PeerId, PeerSession>,
    next_peer_id: u64,
    peer_man: PeerManager,

    tasks: TaskRegistry,
    sync: SyncController,

    fluff: FluffPool,
    stem: StemPool,
    dependent: DependentPool,
    wanted_tx: WantedSet<TxFingerprint>,
    wanted_bbs: WantedSet<BbsMsgId>,
    bbs: BbsReplicator,

    miner: MinerCoordinator,
    workers: Option<WorkerPool>,
    /// Header packs being checked off-thread: job id → (origin, task data).
    pending_hdr_jobs: HashMap<u64, (PeerId, Vec<BlockHeader>)>,

    mempool_dirty: bool,
    last_progress: SyncProgress,
    actions: Vec<NodeAction>,
}

impl<P: Processor> Node<P> {
    pub fn new(cfg: NodeConfig, processor: P, callbacks: NodeCallbacks, identity: SigningKey) -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::with_seed(cfg, processor, callbacks, identity, u64::from_le_bytes(seed[..8].try_into().expect("8 bytes")))
    }

    /// Deterministic construction for tests.
    pub fn with_seed(
        cfg: NodeConfig,
        processor: P,
        callbacks: NodeCallbacks,
        identity: SigningKey,
        seed: u64,
    ) -> Self {
        let workers = (cfg.verification_threads > 0)
            .then(|| WorkerPool::new(cfg.verification_threads));
        Self {
            fluff: FluffPool::new(cfg.max_pool_transactions, cfg.max_pool_bytes),
            stem: StemPool::new(),
            dependent: DependentPool::new(),
            wanted_tx: WantedSet::new(cfg.timeouts.get_tx_ms),
            wanted_bbs: WantedSet::new(cfg.timeouts.get_bbs_ms),
            bbs: BbsReplicator::new(
                cfg.bbs.limit_count,
                cfg.bbs.limit_bytes,
                cfg.bbs.message_timeout_s,
            ),
            miner: MinerCoordinator::new(cfg.mining_threads > 0, cfg.timeouts.mining_soft_restart_ms),
            peer_man: PeerManager::new(cfg.max_peers),
            tasks: TaskRegistry::new(),
            sync: SyncController::new(),
            peers: HashMap::new(),
            next_peer_id: 1,
            pending_hdr_jobs: HashMap::new(),
            workers,
            metrics: NodeMetrics::new(),
            rng: StdRng::seed_from_u64(seed),
            mempool_dirty: false,
            last_progress: SyncProgress::default(),
            actions: Vec::new(),
            identity,
            callbacks,
            processor,
            cfg,
        }
    }

    // -- Accessors (used by the daemon and tests) -------------------------

    pub fn config(&self) -> &NodeConfig {
        &self.cfg
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.identity.verifying_key().to_bytes())
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync.state()
    }

    pub fn sync_progress(&self) -> SyncProgress {
        self.sync.progress()
    }

    pub fn peer_manager(&self) -> &PeerManager {
        &self.peer_man
    }

    pub fn bbs(&self) -> &BbsReplicator {
        &self.bbs
    }

    pub fn mempool(&self) -> &FluffPool {
        &self.fluff
    }

    pub fn stem_pool(&self) -> &StemPool {
        &self.stem
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    pub fn task_registry(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn session(&self, id: PeerId) -> Option<&PeerSession> {
        self.peers.get(&id)
    }

    /// The job currently being mined, if any.
    pub fn miner_job(&self) -> Option<&crate::miner::MiningJob> {
        self.miner.current()
    }

    /// Restore the address book from the peer cache at startup.
    pub fn restore_peers(&mut self, entries: &[(SocketAddr, u32, u64)], now_s: u64) {
        self.peer_man.restore(entries, now_s);
    }

    /// Reload persisted BBS history at startup.
    pub fn load_bbs(&mut self, records: Vec<veil_store::BbsRecord>, now: Timestamp) {
        self.bbs.load(records, now);
    }

    /// Reserve a session id for an incoming/outgoing connection.
    pub fn alloc_peer_id(&mut self) -> PeerId {
        let id = PeerId(self.next_peer_id);
        self.next_peer_id += 1;
        id
    }

    // -- The reactor entry point -----------------------------------------

    /// Process one event at `now_ms` and return the actions to apply.
    pub fn handle_event(&mut self, event: NodeEvent, now_ms: u64) -> Vec<NodeAction> {
        match event {
            NodeEvent::PeerConnected {
                peer,
                addr,
                inbound,
                channel_nonce,
            } => self.on_peer_connected(peer, addr, inbound, channel_nonce, now_ms),
            NodeEvent::PeerDisconnected { peer } => self.destroy_session(peer, now_ms),
            NodeEvent::Message { from, msg } => self.on_peer_message(from, msg, now_ms),
            NodeEvent::Timer(kind) => self.on_timer(kind, now_ms),
            NodeEvent::WorkerDone(done) => self.on_worker_done(done, now_ms),
            NodeEvent::BeaconRx { node_id, addr } => {
                self.peer_man.add_addr(addr, now_ms / 1000);
                self.peer_man.set_id(&addr, node_id);
            }
            NodeEvent::OutboundDrained { peer, bytes } => self.on_drained(peer, bytes, now_ms),
            NodeEvent::MinedSolution { job_id, pow_nonce } => {
                self.on_mined(job_id, pow_nonce, now_ms)
            }
            NodeEvent::LocalTransaction { tx, fluff } => {
                self.metrics.txs_received.inc();
                let status = self.admit_tx(tx, None, fluff, now_ms);
                tracing::debug!(?status, "local transaction admitted");
            }
        }
        self.refresh_gauges();
        self.report_progress();
        std::mem::take(&mut self.actions)
    }

    // -- Outbound plumbing -----------------------------------------------

    /// Queue a message to a peer, accounting its bytes toward the
    /// chocking/drown thresholds.
    fn send(&mut self, peer: PeerId, msg: WireMessage) {
        let Some(session) = self.peers.get_mut(&peer) else {
            return;
        };
        if session.flags.contains(PeerFlags::STOPPING) {
            return;
        }
        let bytes = encoded_len(&msg);
        let queued = session.queue_bytes(bytes);
        self.actions.push(NodeAction::Send { peer, msg });

        if queued > self.cfg.bandwidth.drown {
            tracing::warn!(%peer, queued, "outbound queue drowned, dropping peer");
            self.disconnect(peer, ByeReason::Drown, 0);
        } else if queued > self.cfg.bandwidth.chocking
            && !session.flags.contains(PeerFlags::CHOCKING)
        {
            let Some(session) = self.peers.get_mut(&peer) else {
                return;
            };
            session.flags.insert(PeerFlags::CHOCKING);
            tracing::debug!(%peer, queued, "peer chocking");
        }
    }

    fn disconnect(&mut self, peer: PeerId, reason: ByeReason, now_ms: u64) {
        if let Some(session) = self.peers.get_mut(&peer) {
            if session.flags.contains(PeerFlags::STOPPING) {
                return;
            }
            session.flags.insert(PeerFlags::STOPPING);
            self.actions.push(NodeAction::Send {
                peer,
                msg: WireMessage::Bye { reason },
            });
            self.actions.push(NodeAction::Disconnect { peer, reason });
            self.destroy_session(peer, now_ms);
        }
    }

    /// Protocol violation: coded Bye, heavy rating penalty, teardown.
    fn drop_insane(&mut self, peer: PeerId, now_ms: u64) {
        if let Some(session) = self.peers.get(&peer) {
            let addr = session.addr;
            self.peer_man
                .penalize(&addr, PenaltyReason::ProtocolViolation, now_ms / 1000);
        }
        self.metrics.peers_dropped.inc();
        self.disconnect(peer, ByeReason::ProtocolViolation, now_ms);
    }

    fn destroy_session(&mut self, peer: PeerId, now_ms: u64) {
        let Some(mut session) = self.peers.remove(&peer) else {
            return;
        };
        session.flags.insert(PeerFlags::STOPPING);

        // Queued tasks go back to the unassigned list in original order.
        for key in session.tasks.iter() {
            self.tasks.release(key, Placement::Back);
        }
        // Stems that forwarded through this peer transition to fluff.
        for (fp, entry) in self.stem.orphaned_by(peer) {
            self.stem_to_fluff(fp, entry, FluffReason::RelayPeerLost, now_ms);
        }
        self.bbs.drop_peer(peer);
        self.peer_man.mark_disconnected(&session.addr);
        tracing::debug!(%peer, addr = %session.addr, "session destroyed");

        self.try_assign_tasks(now_ms);
    }

    // -- Connection lifecycle --------------------------------------------

    fn on_peer_connected(
        &mut self,
        peer: PeerId,
        addr: SocketAddr,
        inbound: bool,
        channel_nonce: [u8; 32],
        now_ms: u64,
    ) {
        let now_s = now_ms / 1000;
        if self.peer_man.is_banned(&addr, now_s) {
            self.actions.push(NodeAction::Send {
                peer,
                msg: WireMessage::Bye {
                    reason: ByeReason::Banned,
                },
            });
            self.actions.push(NodeAction::Disconnect {
                peer,
                reason: ByeReason::Banned,
            });
            return;
        }

        let session = PeerSession::new(peer, addr, inbound, channel_nonce, now_ms);
        self.peers.insert(peer, session);
        self.peer_man.add_addr(addr, now_s);
        self.peer_man.mark_connected(&addr, now_s);

        // Identity proof over the shared channel nonce, then login.
        let auth = sign_nonce(&self.identity, &HandshakeNonce(channel_nonce));
        self.send(peer, WireMessage::Authentication(auth));

        let mut flags = LoginFlags::default()
            .with(LoginFlags::SPREADING_TRANSACTIONS)
            .with(LoginFlags::SEND_PEERS);
        if self.bbs.is_enabled() {
            flags = flags.with(LoginFlags::BBS);
        }
        if self.miner.is_enabled() {
            flags = flags.with(LoginFlags::MINING);
        }
        self.send(
            peer,
            WireMessage::Login {
                flags,
                min_peer_fork: self.processor.fork_height(),
            },
        );
        self.send(
            peer,
            WireMessage::PeerInfoSelf {
                port: self.cfg.listen.port(),
            },
        );
    }

    // -- Message dispatch ------------------------------------------------

    fn on_peer_message(&mut self, from: PeerId, msg: WireMessage, now_ms: u64) {
        let Some(session) = self.peers.get_mut(&from) else {
            return;
        };
        if session.flags.contains(PeerFlags::STOPPING) {
            return;
        }
        session.last_activity_ms = now_ms;
        let addr = session.addr;
        self.peer_man.touch(&addr, now_ms / 1000);

        if msg.requires_login() && !self.peers[&from].is_logged_in() {
            tracing::warn!(peer = %from, "message before login");
            self.drop_insane(from, now_ms);
            return;
        }

        match msg {
            // -- Session -------------------------------------------------
            WireMessage::Authentication(auth) => self.on_authentication(from, auth, now_ms),
            WireMessage::Bye { reason } => {
                tracing::debug!(peer = %from, ?reason, "peer said bye");
                self.destroy_session(from, now_ms);
            }
            WireMessage::Ping => self.send(from, WireMessage::Pong),
            WireMessage::Pong => {
                if let Some(s) = self.peers.get_mut(&from) {
                    s.pong_deadline_ms = None;
                }
            }
            WireMessage::Login {
                flags,
                min_peer_fork,
            } => self.on_login(from, flags, min_peer_fork, now_ms),
            WireMessage::PeerInfoSelf { port } => {
                let reachable = SocketAddr::new(addr.ip(), port);
                self.peer_man.add_addr(reachable, now_ms / 1000);
            }
            WireMessage::PeerInfo(info) => {
                self.peer_man.add_addr(info.addr, now_ms / 1000);
                self.peer_man.set_id(&info.addr, info.id);
            }
            WireMessage::GetExternalAddr => {
                self.send(from, WireMessage::ExternalAddr { addr });
            }
            WireMessage::ExternalAddr { .. } => {}

            // -- Chain: announcements and client-side completions --------
            WireMessage::NewTip { header } => self.on_new_tip(from, header, now_ms),
            WireMessage::Hdr { header } => self.on_hdr_pack(from, vec![header], now_ms),
            WireMessage::HdrPack { headers } => self.on_hdr_pack(from, headers, now_ms),
            WireMessage::Body { body } => self.on_body(from, body, now_ms),
            WireMessage::BodyPack { bodies } => self.on_body_pack(from, bodies, now_ms),
            WireMessage::DataMissing => self.on_data_missing(from, now_ms),

            // -- Chain: server side ---------------------------------------
            WireMessage::GetHdr { id } => {
                let reply = match self.processor.header_at(id.height) {
                    Some(h) if h.hash() == id.hash => WireMessage::Hdr { header: h },
                    _ => WireMessage::DataMissing,
                };
                self.send(from, reply);
            }
            WireMessage::GetHdrPack { top, count } => self.serve_hdr_pack(from, top, count),
            WireMessage::EnumHdrs {
                min_height,
                max_height,
            } => self.serve_enum_hdrs(from, min_height, max_height),
            WireMessage::GetBody { id } => {
                let reply = match (self.processor.header_at(id.height), self.processor.body_at(id.height)) {
                    (Some(h), Some(body)) if h.hash() == id.hash => WireMessage::Body { body },
                    _ => WireMessage::DataMissing,
                };
                self.send(from, reply);
            }
            WireMessage::GetBodyPack {
                top,
                count,
                max_size,
            } => self.serve_body_pack(from, top, count, max_size),
            WireMessage::GetCommonState { ids } => {
                let common = ids.into_iter().find(|id| {
                    self.processor
                        .header_at(id.height)
                        .map(|h| h.hash() == id.hash)
                        .unwrap_or(false)
                });
                self.send(from, WireMessage::CommonState { id: common });
            }
            WireMessage::CommonState { .. } => {}

            // -- Proof service --------------------------------------------
            WireMessage::GetProofState { height } => {
                self.serve_proof(from, ProofQuery::State { height })
            }
            WireMessage::GetProofChainWork => self.serve_proof(from, ProofQuery::ChainWork),
            WireMessage::GetProofKernel { kernel_id } => {
                self.serve_proof(from, ProofQuery::Kernel { kernel_id })
            }
            WireMessage::GetProofKernel2 {
                kernel_id,
                fetch_kernel,
            } => self.serve_proof(
                from,
                ProofQuery::Kernel2 {
                    kernel_id,
                    fetch_kernel,
                },
            ),
            WireMessage::GetProofUtxo { commitment } => {
                self.serve_proof(from, ProofQuery::Utxo { commitment })
            }
            WireMessage::GetProofShieldedOutp { serial } => {
                self.serve_proof(from, ProofQuery::ShieldedOutp { serial })
            }
            WireMessage::GetProofShieldedInp { serial } => {
                self.serve_proof(from, ProofQuery::ShieldedInp { serial })
            }
            WireMessage::GetProofAsset { asset_id } => {
                self.serve_proof(from, ProofQuery::Asset { asset_id })
            }
            WireMessage::GetShieldedList { id0, count } => {
                self.serve_proof(from, ProofQuery::ShieldedList { id0, count })
            }
            WireMessage::GetShieldedOutputsAt { height } => {
                self.serve_proof(from, ProofQuery::ShieldedOutputsAt { height })
            }
            WireMessage::Proof { .. } => {}
            WireMessage::GetEvents { height_from } => {
                let reply = match self.processor.query(&ProofQuery::Events { height_from }) {
                    Some(data) => WireMessage::Events { data },
                    None => WireMessage::DataMissing,
                };
                self.send(from, reply);
            }
            WireMessage::Events { .. } => {}
            WireMessage::GetStateSummary => {
                let reply = match self.processor.query(&ProofQuery::StateSummary) {
                    Some(data) => WireMessage::StateSummary { data },
                    None => WireMessage::DataMissing,
                };
                self.send(from, reply);
            }
            WireMessage::StateSummary { .. } => {}
            WireMessage::ContractVarsEnum { key_min, key_max } => {
                self.serve_proof(from, ProofQuery::ContractVars { key_min, key_max })
            }
            WireMessage::ContractLogsEnum {
                key_min,
                key_max,
                pos_min,
                pos_max,
            } => self.serve_proof(
                from,
                ProofQuery::ContractLogs {
                    key_min,
                    key_max,
                    pos_min,
                    pos_max,
                },
            ),
            WireMessage::GetContractVar { key } => {
                self.serve_proof(from, ProofQuery::ContractVar { key })
            }
            WireMessage::GetContractLogProof { pos } => {
                self.serve_proof(from, ProofQuery::ContractLogProof { pos })
            }

            // -- Transactions ---------------------------------------------
            WireMessage::NewTransaction { tx, fluff, context } => {
                self.metrics.txs_received.inc();
                match context {
                    Some(ctx) => self.on_dependent_tx(from, tx, ctx, now_ms),
                    None => {
                        let status = self.admit_tx(tx, Some(from), fluff, now_ms);
                        if !status.is_ok() {
                            if let Some(s) = self.peers.get(&from) {
                                let addr = s.addr;
                                self.peer_man.penalize(
                                    &addr,
                                    PenaltyReason::InvalidTransaction,
                                    now_ms / 1000,
                                );
                            }
                        }
                    }
                }
            }
            WireMessage::HaveTransaction { id } => {
                if !self.fluff.contains(&id)
                    && !self.stem.contains(&id)
                    && self.wanted_tx.add(id, now_ms)
                {
                    self.send(from, WireMessage::GetTransaction { id });
                }
            }
            WireMessage::GetTransaction { id } => {
                // Stem entries are never served: they are not ours to leak.
                let reply = match self.fluff.get(&id) {
                    Some(entry) => WireMessage::NewTransaction {
                        tx: entry.tx.clone(),
                        fluff: true,
                        context: entry.context,
                    },
                    None => WireMessage::DataMissing,
                };
                self.send(from, reply);
            }

            // -- Dependent contexts ---------------------------------------
            WireMessage::SetDependentContext { context } => {
                if let Some(s) = self.peers.get_mut(&from) {
                    s.dependent_ctx = context;
                }
                let best = self.dependent.best();
                self.send(from, WireMessage::DependentContextState { best });
            }
            WireMessage::DependentContextState { .. } => {}

            // -- BBS ------------------------------------------------------
            WireMessage::BbsMsg(msg) => self.on_bbs_msg(from, msg, now_ms),
            WireMessage::BbsHaveMsg { id } => {
                if self.bbs.is_enabled()
                    && !self.bbs.contains(&id)
                    && self.wanted_bbs.add(id, now_ms)
                {
                    self.send(from, WireMessage::BbsGetMsg { id });
                }
            }
            WireMessage::BbsGetMsg { id } => {
                let reply = match self.bbs.get(&id) {
                    Some(msg) => WireMessage::BbsMsg(msg.clone()),
                    None => WireMessage::DataMissing,
                };
                self.send(from, reply);
            }
            WireMessage::BbsSubscribe {
                channel,
                time_from,
                on,
            } => {
                if !self.bbs.is_enabled() {
                    return;
                }
                if on {
                    let backlog = self.bbs.subscribe(from, channel, time_from);
                    if let Some(s) = self.peers.get_mut(&from) {
                        s.subscriptions.insert(channel);
                    }
                    for id in backlog {
                        self.send(from, WireMessage::BbsHaveMsg { id });
                    }
                } else {
                    self.bbs.unsubscribe(from, channel);
                    if let Some(s) = self.peers.get_mut(&from) {
                        s.subscriptions.remove(&channel);
                    }
                }
            }
            WireMessage::BbsResetSync { time_from } => {
                for id in self.bbs.backlog_for_peer(from, time_from) {
                    self.send(from, WireMessage::BbsHaveMsg { id });
                }
            }
        }
    }

    // -- Session messages -------------------------------------------------

    fn on_authentication(&mut self, from: PeerId, auth: Authentication, now_ms: u64) {
        let Some(session) = self.peers.get(&from) else {
            return;
        };
        let nonce = HandshakeNonce(session.channel_nonce);
        if verify_authentication(&nonce, &auth).is_err() {
            tracing::warn!(peer = %from, "bad authentication signature");
            self.drop_insane(from, now_ms);
            return;
        }
        // One session per node identity.
        let duplicate = self
            .peers
            .iter()
            .any(|(id, s)| *id != from && s.node_id == Some(auth.node_id));
        if duplicate {
            self.disconnect(from, ByeReason::DuplicateConnection, now_ms);
            return;
        }
        let addr = session.addr;
        if let Some(s) = self.peers.get_mut(&from) {
            s.node_id = Some(auth.node_id);
        }
        self.peer_man.set_id(&addr, auth.node_id);
    }

    fn on_login(&mut self, from: PeerId, flags: LoginFlags, min_peer_fork: Height, now_ms: u64) {
        if min_peer_fork > self.processor.fork_height() {
            tracing::warn!(peer = %from, min_peer_fork, "peer requires a newer fork");
            if let Some(s) = self.peers.get(&from) {
                let addr = s.addr;
                self.peer_man.ban(&addr, now_ms / 1000);
            }
            self.disconnect(from, ByeReason::ForkIncompatible, now_ms);
            return;
        }
        let Some(session) = self.peers.get_mut(&from) else {
            return;
        };
        session.login_flags = flags;
        session.min_peer_fork = min_peer_fork;
        session.flags.insert(PeerFlags::LOGIN_RECEIVED);
        if flags.contains(LoginFlags::OWNER) {
            session.flags.insert(PeerFlags::OWNER);
        }
        tracing::info!(peer = %from, flags = ?flags, "peer logged in");

        if let Some(header) = self.processor.tip_header() {
            self.send(from, WireMessage::NewTip { header });
        }
        self.stream_tx_announcements(from);
        self.try_assign_tasks(now_ms);
    }

    /// Push `HaveTransaction` for every fluff entry past the peer's cursor.
    fn stream_tx_announcements(&mut self, peer: PeerId) {
        let Some(session) = self.peers.get(&peer) else {
            return;
        };
        if !session.login_flags.contains(LoginFlags::SPREADING_TRANSACTIONS) {
            return;
        }
        let pending = self.fluff.announced_after(session.tx_cursor);
        let Some(&(last_seq, _)) = pending.last() else {
            return;
        };
        for (_, fp) in &pending {
            self.send(peer, WireMessage::HaveTransaction { id: *fp });
        }
        if let Some(session) = self.peers.get_mut(&peer) {
            session.tx_cursor = last_seq;
        }
    }

    // -- Chain serving -----------------------------------------------------

    fn serve_hdr_pack(&mut self, from: PeerId, top: BlockId, count: u32) {
        let count = count.clamp(1, self.cfg.hdr_pack_size) as u64;
        let ours = self.processor.header_at(top.height);
        let reply = match ours {
            Some(h) if h.hash() == top.hash => {
                let lo = (top.height + 1).saturating_sub(count).max(1);
                let headers: Vec<BlockHeader> = (lo..=top.height)
                    .filter_map(|h| self.processor.header_at(h))
                    .collect();
                WireMessage::HdrPack { headers }
            }
            _ => WireMessage::DataMissing,
        };
        self.send(from, reply);
    }

    fn serve_enum_hdrs(&mut self, from: PeerId, min_height: Height, max_height: Height) {
        let max_height = max_height.min(min_height.saturating_add(self.cfg.hdr_pack_size as u64));
        let headers: Vec<BlockHeader> = (min_height..=max_height)
            .filter_map(|h| self.processor.header_at(h))
            .collect();
        if headers.is_empty() {
            self.send(from, WireMessage::DataMissing);
        } else {
            self.send(from, WireMessage::HdrPack { headers });
        }
    }

    fn serve_body_pack(&mut self, from: PeerId, top: BlockId, count: u32, max_size: u32) {
        let count = count.min(self.cfg.bandwidth.max_body_pack_count) as u64;
        let size_cap = (max_size as usize).min(self.cfg.bandwidth.max_body_pack_size);

        let valid_top = self
            .processor
            .header_at(top.height)
            .map(|h| h.hash() == top.hash)
            .unwrap_or(false);
        if !valid_top || count == 0 {
            self.send(from, WireMessage::DataMissing);
            return;
        }

        // Collect ascending, oldest first, within both caps.
        let lo = (top.height + 1).saturating_sub(count).max(1);
        let mut bodies = Vec::new();
        let mut total = 0usize;
        for h in lo..=top.height {
            let Some(body) = self.processor.body_at(h) else {
                break;
            };
            if total + body.len() > size_cap && !bodies.is_empty() {
                break;
            }
            total += body.len();
            bodies.push(body);
        }
        if bodies.is_empty() {
            self.send(from, WireMessage::DataMissing);
        } else {
            self.send(from, WireMessage::BodyPack { bodies });
        }
    }

    fn serve_proof(&mut self, from: PeerId, query: ProofQuery) {
        let data = self.processor.query(&query);
        self.send(from, WireMessage::Proof { data });
    }

    // -- Tip tracking and sync --------------------------------------------

    fn on_new_tip(&mut self, from: PeerId, header: BlockHeader, now_ms: u64) {
        if header.height == 0 {
            self.drop_insane(from, now_ms);
            return;
        }
        let Some(session) = self.peers.get_mut(&from) else {
            return;
        };
        session.tip = Some(header.clone());
        session.clear_rejected();

        if header.chain_work <= self.processor.chain_work() {
            return;
        }
        self.consider_peer_tip(from, header, now_ms);
    }

    fn consider_peer_tip(&mut self, from: PeerId, header: BlockHeader, now_ms: u64) {
        let target = header.id();
        let local = self.processor.header_tip().map(|id| id.height).unwrap_or(0);

        match self.sync.state() {
            SyncState::Idle => {
                self.sync.begin_header_round(local, target);
                self.request_headers(target);
                self.try_assign_tasks(now_ms);
            }
            SyncState::HeaderSync | SyncState::FastSyncBodies | SyncState::Congested => {
                self.sync.extend_target(target);
                if self.sync.state() == SyncState::HeaderSync {
                    self.request_headers(target);
                    self.try_assign_tasks(now_ms);
                }
            }
            SyncState::Tip => {
                let gap = target.height.saturating_sub(local);
                match SyncController::tip_gap_action(gap, self.cfg.tip_resync_gap) {
                    TipGapAction::None => {
                        // Same height but more work: a competing branch.
                        if target.height == local {
                            self.request_headers(target);
                            self.try_assign_tasks(now_ms);
                        }
                    }
                    TipGapAction::FetchBlocks => {
                        // The announcement carries the header; attach it
                        // directly when it extends, otherwise walk back.
                        let tip_hash = self.processor.header_tip().map(|id| id.hash);
                        let extends = gap == 1 && Some(header.prev) == tip_hash;
                        if extends {
                            let (status, events) = self.processor.apply_headers(&[header]);
                            if status == DataStatus::Accepted {
                                self.metrics.headers_applied.inc();
                                self.handle_processor_events(events, now_ms);
                                self.request_body(target, now_ms);
                            }
                        } else {
                            self.request_headers(target);
                        }
                        self.try_assign_tasks(now_ms);
                    }
                    TipGapAction::Resync => {
                        self.sync.begin_header_round(local, target);
                        self.request_headers(target);
                        self.try_assign_tasks(now_ms);
                    }
                }
            }
        }
    }

    /// Ask for a header pack ending at `target`.
    fn request_headers(&mut self, target: BlockId) {
        let local = self.processor.header_tip().map(|id| id.height).unwrap_or(0);
        if target.height <= local && local != 0 {
            // A sibling branch at or below our height: walk back from the
            // branch tip far enough to reach the divergence point.
            let count = self.cfg.hdr_pack_size;
            self.tasks.request((target, false), count, target, None);
            return;
        }
        let gap = target.height - local;
        let count = gap.min(self.cfg.hdr_pack_size as u64) as u32;
        self.tasks.request((target, false), count, target, None);
    }

    /// Ask for a single body.
    fn request_body(&mut self, id: BlockId, now_ms: u64) {
        let window = self.sync.window();
        self.tasks.request((id, true), 1, id, window);
        self.try_assign_tasks(now_ms);
    }

    /// Create body tasks covering the fast-sync window.
    fn request_window_bodies(&mut self, now_ms: u64) {
        let (Some(window), Some(target)) = (self.sync.window(), self.sync.target()) else {
            return;
        };
        for height in window.h0..=target.height {
            if self.processor.body_at(height).is_some() {
                self.sync.note_body_applied();
                continue;
            }
            let Some(header) = self.processor.header_at(height) else {
                continue;
            };
            self.tasks
                .request((header.id(), true), 1, target, Some(window));
        }
        self.try_assign_tasks(now_ms);
    }

    // -- Task completions --------------------------------------------------

    fn on_worker_done(&mut self, done: crate::workers::JobDone, now_ms: u64) {
        if let Some((peer, headers)) = self.pending_hdr_jobs.remove(&done.job_id) {
            match done.outcome {
                JobOutcome::HeadersChecked { ok: true } => {
                    self.finish_headers(peer, headers, now_ms)
                }
                JobOutcome::HeadersChecked { ok: false } => self.on_bad_headers(peer, now_ms),
                JobOutcome::Cancelled => {}
            }
        }
    }

    /// The first queued task must exist and match the response kind.
    /// Completes it in the registry and returns it.
    fn take_first_task(
        &mut self,
        from: PeerId,
        want_body: bool,
        now_ms: u64,
    ) -> Option<crate::tasks::Task> {
        let session = self.peers.get_mut(&from)?;
        let Some(&key) = session.tasks.front() else {
            tracing::warn!(peer = %from, "unsolicited data message");
            self.drop_insane(from, now_ms);
            return None;
        };
        if key.1 != want_body {
            self.drop_insane(from, now_ms);
            return None;
        }
        session.tasks.pop_front();
        session.note_success();
        let task = self.tasks.complete(&key)?;
        if let Some(assigned_at) = task.assigned_at_ms {
            let sample = now_ms.saturating_sub(assigned_at);
            if let Some(s) = self.peers.get_mut(&from) {
                s.record_latency(sample);
            }
        }
        Some(task)
    }

    fn on_hdr_pack(&mut self, from: PeerId, headers: Vec<BlockHeader>, now_ms: u64) {
        let Some(task) = self.take_first_task(from, false, now_ms) else {
            return;
        };
        // The pack must end at the requested block.
        let valid_shape = headers
            .last()
            .map(|last| last.id() == task.key.0)
            .unwrap_or(false);
        if !valid_shape {
            self.drop_insane(from, now_ms);
            return;
        }
        let bytes: usize = headers.len() * std::mem::size_of::<BlockHeader>();
        if let Some(s) = self.peers.get(&from) {
            let addr = s.addr;
            self.peer_man.reward_data(&addr, bytes);
        }

        if let Some(pool) = self.workers.as_mut() {
            let (job_id, _stop) = pool.submit(JobKind::CheckHeaders(headers.clone()));
            self.pending_hdr_jobs.insert(job_id, (from, headers));
        } else {
            if !check_header_chain(&headers) {
                self.on_bad_headers(from, now_ms);
                return;
            }
            self.finish_headers(from, headers, now_ms);
        }
        self.try_assign_tasks(now_ms);
    }

    /// A header pack failed validation: penalize, and disconnect peers
    /// rated high enough that the failure cannot be an honest mistake.
    fn on_bad_headers(&mut self, from: PeerId, now_ms: u64) {
        let Some(session) = self.peers.get(&from) else {
            return;
        };
        let addr = session.addr;
        let now_s = now_ms / 1000;
        let rating = self
            .peer_man
            .get(&addr)
            .map(|p| p.adjusted_rating(now_s))
            .unwrap_or(0);
        self.peer_man
            .penalize(&addr, PenaltyReason::InvalidBlock, now_s);
        if rating >= RATING_INITIAL {
            self.disconnect(from, ByeReason::ProtocolViolation, now_ms);
        }
    }

    /// Attach a validated header run, handling reorg policy.
    fn finish_headers(&mut self, from: PeerId, headers: Vec<BlockHeader>, now_ms: u64) {
        // Headers we already have (the shared prefix of a branch) carry no
        // information; trimming them makes `first` the divergence point.
        let headers: Vec<BlockHeader> = headers
            .into_iter()
            .skip_while(|h| {
                self.processor
                    .header_at(h.height)
                    .map(|mine| mine.hash() == h.hash())
                    .unwrap_or(false)
            })
            .collect();
        let Some(first) = headers.first() else {
            return;
        };

        // Reorg gate: attaching below the validated tip means rolling the
        // state back first.
        if let Some(state_tip) = self.processor.tip() {
            if first.height <= state_tip.height {
                let depth = state_tip.height - (first.height - 1);
                let allowed = self.sync.rollback_allowed(
                    depth,
                    now_ms / 1000,
                    self.cfg.rollback.max_auto,
                    self.cfg.rollback.timeout_since_tip_s,
                    self.processor.hard_max_rollback(),
                );
                if !allowed {
                    tracing::warn!(
                        depth,
                        max_auto = self.cfg.rollback.max_auto,
                        "rollback refused; keeping current tip"
                    );
                    self.callbacks.sync_error(SyncError::RollbackExceedsLimit);
                    return;
                }
                let events = self.processor.rollback_to(first.height - 1);
                self.handle_processor_events(events, now_ms);
            }
        } else if let Some(header_tip) = self.processor.header_tip() {
            // Header-only reorg (no validated state yet): trimming headers
            // carries no rollback cost.
            if first.height <= header_tip.height {
                let events = self.processor.rollback_to(first.height - 1);
                self.handle_processor_events(events, now_ms);
            }
        }

        let (status, events) = self.processor.apply_headers(&headers);
        match status {
            DataStatus::Accepted => {
                self.metrics.headers_applied.inc_by(headers.len() as u64);
                self.sync.note_headers_applied(headers.len() as u64);
                self.handle_processor_events(events, now_ms);

                let covered = self.processor.header_tip().map(|id| id.height).unwrap_or(0);
                match self.sync.state() {
                    SyncState::HeaderSync => {
                        if self.sync.headers_complete(covered) {
                            let target = self.sync.target().expect("target set in HeaderSync");
                            let window = self.processor.fast_sync_window(&target);
                            self.sync.begin_body_phase(window);
                            self.request_window_bodies(now_ms);
                        } else if let Some(target) = self.sync.target() {
                            // Keep climbing toward the target.
                            self.request_headers(target);
                            self.try_assign_tasks(now_ms);
                        }
                    }
                    SyncState::Tip => {
                        // Reorg or short catch-up: fetch bodies for every
                        // header beyond the validated state.
                        let state = self.processor.tip().map(|id| id.height).unwrap_or(0);
                        for height in state + 1..=covered {
                            if self.processor.body_at(height).is_some() {
                                continue;
                            }
                            let Some(header) = self.processor.header_at(height) else {
                                continue;
                            };
                            let id = header.id();
                            self.tasks.request((id, true), 1, id, None);
                        }
                        self.try_assign_tasks(now_ms);
                    }
                    _ => {}
                }
            }
            DataStatus::Unreachable => {
                // Walk further back: ask for the pack ending just below
                // this run.
                let parent = BlockId::new(first.height.saturating_sub(1), first.prev);
                if parent.height > 0 {
                    let target = self.sync.target().unwrap_or(parent);
                    self.tasks
                        .request((parent, false), self.cfg.hdr_pack_size, target, None);
                    self.try_assign_tasks(now_ms);
                }
            }
            DataStatus::Invalid => self.on_bad_headers(from, now_ms),
            DataStatus::Rejected => {}
        }
    }

    fn on_body(&mut self, from: PeerId, body: Vec<u8>, now_ms: u64) {
        let Some(task) = self.take_first_task(from, true, now_ms) else {
            return;
        };
        if let Some(s) = self.peers.get(&from) {
            let addr = s.addr;
            self.peer_man.reward_data(&addr, body.len());
        }
        self.apply_body(from, task.key.0, body, now_ms);
        self.try_assign_tasks(now_ms);
    }

    fn on_body_pack(&mut self, from: PeerId, bodies: Vec<Vec<u8>>, now_ms: u64) {
        let Some(task) = self.take_first_task(from, true, now_ms) else {
            return;
        };
        if bodies.is_empty() || bodies.len() as u32 > task.count.max(1) {
            self.drop_insane(from, now_ms);
            return;
        }
        let total: usize = bodies.iter().map(|b| b.len()).sum();
        if let Some(s) = self.peers.get(&from) {
            let addr = s.addr;
            self.peer_man.reward_data(&addr, total);
        }
        // Bodies are ascending, ending at the requested block.
        let top = task.key.0.height;
        let lo = top + 1 - bodies.len() as u64;
        for (i, body) in bodies.into_iter().enumerate() {
            let height = lo + i as u64;
            let Some(header) = self.processor.header_at(height) else {
                continue;
            };
            self.apply_body(from, header.id(), body, now_ms);
        }
        self.try_assign_tasks(now_ms);
    }

    fn apply_body(&mut self, from: PeerId, id: BlockId, body: Vec<u8>, now_ms: u64) {
        let fast_sync = self
            .sync
            .window()
            .map(|w| id.height >= w.h0)
            .unwrap_or(false)
            && self.sync.state() == SyncState::FastSyncBodies;
        let (status, events) = self.processor.apply_body(&id, &body, fast_sync);
        match status {
            DataStatus::Accepted => {
                self.metrics.bodies_applied.inc();
                if self.sync.state() == SyncState::FastSyncBodies {
                    self.sync.note_body_applied();
                }
                self.handle_processor_events(events, now_ms);
            }
            DataStatus::Invalid => {
                let Some(session) = self.peers.get(&from) else {
                    return;
                };
                let addr = session.addr;
                let now_s = now_ms / 1000;
                let rating = self
                    .peer_man
                    .get(&addr)
                    .map(|p| p.adjusted_rating(now_s))
                    .unwrap_or(0);
                self.peer_man
                    .penalize(&addr, PenaltyReason::InvalidBlock, now_s);
                if rating >= RATING_INITIAL {
                    self.disconnect(from, ByeReason::ProtocolViolation, now_ms);
                }
                // Someone else may have it right.
                self.tasks.request((id, true), 1, id, self.sync.window());
            }
            DataStatus::Rejected | DataStatus::Unreachable => {}
        }
    }

    fn on_data_missing(&mut self, from: PeerId, now_ms: u64) {
        let Some(session) = self.peers.get_mut(&from) else {
            return;
        };
        let Some(key) = session.tasks.pop_front() else {
            self.drop_insane(from, now_ms);
            return;
        };
        session.rejected_keys.insert(key);
        session.note_success(); // answered, just empty-handed
        self.tasks.release(&key, Placement::Front);
        self.try_assign_tasks(now_ms);
    }

    // -- Processor events --------------------------------------------------

    fn handle_processor_events(&mut self, events: Vec<ProcessorEvent>, now_ms: u64) {
        for event in events {
            match event {
                ProcessorEvent::NewState(id) => self.on_new_state(id, now_ms),
                ProcessorEvent::RolledBack(id) => {
                    tracing::info!(tip = %id, "chain rolled back");
                    self.dependent.clear();
                    self.callbacks.rolled_back(&id);
                }
                ProcessorEvent::FastSyncDone => {
                    self.sync.enter_tip(now_ms / 1000);
                }
            }
        }
    }

    fn on_new_state(&mut self, id: BlockId, now_ms: u64) {
        tracing::info!(tip = %id, "new state");
        self.sync.on_tip_adopted(now_ms / 1000);
        self.callbacks.state_changed(&id);

        // The dependent chain was built on the previous tip.
        self.dependent.clear();

        // Transactions that can no longer be mined leave the pool quietly.
        self.fluff.drop_expired(id.height + 1);

        // Forced fluff beats any concurrent stem timer: transitioning here
        // removes the entry from the timer set before the timer can fire.
        for (fp, entry) in self.stem.confirm_due(id.height) {
            self.stem_to_fluff(fp, entry, FluffReason::ConfirmDeadline, now_ms);
        }

        self.rebuild_template(now_ms);
        self.broadcast_new_tip(now_ms);
    }

    fn broadcast_new_tip(&mut self, _now_ms: u64) {
        let Some(header) = self.processor.tip_header() else {
            return;
        };
        let targets: Vec<PeerId> = self
            .peers
            .values()
            .filter(|s| s.is_logged_in())
            .filter(|s| {
                s.tip
                    .as_ref()
                    .map(|t| t.hash() != header.hash())
                    .unwrap_or(true)
            })
            .map(|s| s.id)
            .collect();
        for peer in targets {
            self.send(peer, WireMessage::NewTip { header: header.clone() });
        }
    }

    fn rebuild_template(&mut self, now_ms: u64) {
        if !self.miner.is_enabled() {
            return;
        }
        let selected = self.fluff.select_for_template(TEMPLATE_MAX_WEIGHT);
        let txs: Vec<&Transaction> = selected.iter().map(|e| &e.tx).collect();
        if let Some(template) = self.processor.build_template(&txs) {
            self.miner.restart(template, now_ms);
        }
        self.mempool_dirty = false;
    }

    fn on_mined(&mut self, job_id: u64, pow_nonce: u64, now_ms: u64) {
        match self.miner.on_solution(job_id, pow_nonce) {
            SolutionOutcome::Stale => {
                tracing::debug!(job_id, "stale mining solution discarded");
            }
            SolutionOutcome::Accepted { header, body } => {
                tracing::info!(height = header.height, "mined block");
                let id = header.id();
                let (status, events) = self.processor.apply_headers(&[header]);
                if status == DataStatus::Accepted {
                    let (_, body_events) = self.processor.apply_body(&id, &body, false);
                    self.handle_processor_events(events, now_ms);
                    self.handle_processor_events(body_events, now_ms);
                }
            }
        }
    }

    // -- Dandelion ---------------------------------------------------------

    /// Full admission path for a non-dependent transaction.
    fn admit_tx(
        &mut self,
        tx: Transaction,
        from: Option<PeerId>,
        fluff: bool,
        now_ms: u64,
    ) -> TxStatus {
        let fp = tx.fingerprint();
        if self.fluff.contains(&fp) || self.stem.contains(&fp) {
            return TxStatus::AlreadyKnown;
        }
        if tx.height_range().is_empty() {
            return TxStatus::HeightOutOfRange;
        }
        let validation = self.processor.validate_tx(&tx, None);
        if !validation.status.is_ok() {
            return validation.status;
        }
        self.wanted_tx.remove(&fp);

        if fluff {
            return self.insert_fluff(tx, validation.new_context, from, now_ms);
        }

        // Stem admission: coin flip drawn over 0..0xFFFF so the two
        // configured extremes are exact.
        let draw = self.rng.gen_range(0..0xFFFFu32);
        if draw < self.cfg.dandelion.fluff_probability as u32 {
            if self.cfg.log_tx_fluff {
                tracing::debug!(tx = %fp, "stem tx fluffed at admission");
            }
            return self.insert_fluff(tx, validation.new_context, from, now_ms);
        }

        // Try merging into an aggregating stem first.
        let range = tx.height_range();
        if let Some(target_fp) =
            self.stem
                .aggregation_candidate(&range, self.cfg.dandelion.outputs_max)
        {
            if target_fp != fp {
                if let Some(mut target) = self.stem.remove(&target_fp) {
                    target.tx.merge(tx);
                    target.fee_reserve += validation.fee_reserve;
                    let merged_fp = target.tx.fingerprint();
                    if target.tx.outputs.len() as u32 >= self.cfg.dandelion.outputs_min {
                        self.stem_to_fluff(merged_fp, target, FluffReason::Aggregated, now_ms);
                    } else {
                        self.stem.insert(merged_fp, target);
                    }
                    self.metrics.txs_accepted.inc();
                    return TxStatus::Accepted;
                }
            }
        }

        let timeout = self.rng.gen_range(
            self.cfg.dandelion.timeout_min_ms..=self.cfg.dandelion.timeout_max_ms,
        );
        let relay_peer = self.pick_stem_relay(from);
        let confirm_deadline = self
            .processor
            .tip()
            .map(|tip| tip.height + self.cfg.dandelion.dh_stem_confirm);

        let entry = StemEntry {
            tx: tx.clone(),
            context: validation.new_context,
            relay_peer,
            timeout_at_ms: now_ms + timeout,
            aggregation_deadline_ms: Some(now_ms + self.cfg.dandelion.aggregation_time_ms),
            aggregating: true,
            fee_reserve: validation.fee_reserve,
            confirm_deadline,
        };

        match relay_peer {
            Some(peer) => {
                if self.cfg.log_tx_stem {
                    tracing::debug!(tx = %fp, %peer, "stem tx forwarded");
                }
                self.stem.insert(fp, entry);
                self.send(
                    peer,
                    WireMessage::NewTransaction {
                        tx,
                        fluff: false,
                        context: None,
                    },
                );
                self.metrics.txs_accepted.inc();
                TxStatus::Accepted
            }
            None => {
                // Nobody to stem through: fluff is the only option left.
                self.stem_to_fluff(fp, entry, FluffReason::RelayPeerLost, now_ms);
                self.metrics.txs_accepted.inc();
                TxStatus::Accepted
            }
        }
    }

    /// A spreading-capable peer other than the originator.
    fn pick_stem_relay(&mut self, exclude: Option<PeerId>) -> Option<PeerId> {
        let candidates: Vec<PeerId> = self
            .peers
            .values()
            .filter(|s| s.is_logged_in())
            .filter(|s| s.login_flags.contains(LoginFlags::SPREADING_TRANSACTIONS))
            .filter(|s| Some(s.id) != exclude)
            .map(|s| s.id)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let idx = self.rng.gen_range(0..candidates.len());
        Some(candidates[idx])
    }

    fn insert_fluff(
        &mut self,
        tx: Transaction,
        context: Option<ContextHash>,
        exclude: Option<PeerId>,
        now_ms: u64,
    ) -> TxStatus {
        let fp = tx.fingerprint();
        match self.fluff.insert(tx, context, now_ms) {
            FluffInsert::Duplicate => TxStatus::AlreadyKnown,
            FluffInsert::BelowMinimum => TxStatus::TooLowFee,
            FluffInsert::Inserted { evicted } => {
                if !evicted.is_empty() {
                    tracing::debug!(count = evicted.len(), "fluff pool evicted for capacity");
                }
                if self.cfg.log_tx_fluff {
                    tracing::debug!(tx = %fp, "tx in fluff pool");
                }
                self.metrics.txs_accepted.inc();
                self.mempool_dirty = true;

                // Announce to every relay-capable peer except the source.
                let targets: Vec<PeerId> = self
                    .peers
                    .values()
                    .filter(|s| s.is_logged_in())
                    .filter(|s| s.login_flags.contains(LoginFlags::SPREADING_TRANSACTIONS))
                    .filter(|s| Some(s.id) != exclude)
                    .map(|s| s.id)
                    .collect();
                for peer in targets {
                    self.send(peer, WireMessage::HaveTransaction { id: fp });
                    if let Some(s) = self.peers.get_mut(&peer) {
                        s.tx_cursor = self.fluff.latest_seq();
                    }
                }
                TxStatus::Accepted
            }
        }
    }

    /// The one-way stem→fluff transition. `entry` has already been removed
    /// from the stem pool, so no second transition can occur.
    fn stem_to_fluff(
        &mut self,
        fp: TxFingerprint,
        mut entry: StemEntry,
        reason: FluffReason,
        now_ms: u64,
    ) {
        if self.cfg.log_tx_stem {
            tracing::debug!(tx = %fp, ?reason, "stem tx transitions to fluff");
        }
        if entry.aggregating {
            self.add_dummy_outputs(&mut entry);
        }
        self.insert_fluff(entry.tx, entry.context, None, now_ms);
    }

    /// Pad an aggregate with dummy outputs funded from the fee reserve.
    /// Each dummy gets a spend height sampled from the configured lifetime
    /// range above the current tip.
    fn add_dummy_outputs(&mut self, entry: &mut StemEntry) {
        let lo = self.cfg.dandelion.dummy_lifetime_lo;
        let hi = self.cfg.dandelion.dummy_lifetime_hi;
        if hi == 0 || hi < lo {
            return;
        }
        let tip_height = self.processor.tip().map(|t| t.height).unwrap_or(0);
        // One output's worth of reserve per dummy.
        const DUMMY_COST: u64 = 100;
        while (entry.tx.outputs.len() as u32) < self.cfg.dandelion.outputs_min
            && entry.fee_reserve >= DUMMY_COST
        {
            entry.fee_reserve -= DUMMY_COST;
            let mut commitment = [0u8; 33];
            self.rng.fill_bytes(&mut commitment);
            let spend_height = tip_height + self.rng.gen_range(lo..=hi);
            entry.tx.outputs.push(TxOutput {
                commitment,
                dummy_spend_height: Some(spend_height),
            });
        }
    }

    // -- Dependent transactions --------------------------------------------

    fn on_dependent_tx(&mut self, from: PeerId, tx: Transaction, parent: ContextHash, now_ms: u64) {
        let fp = tx.fingerprint();
        if self.dependent.contains_tx(&fp) {
            return;
        }
        if !self.dependent.parent_known(Some(&parent)) {
            tracing::debug!(peer = %from, "dependent tx with unknown parent context");
            return;
        }
        let validation = self.processor.validate_tx(&tx, Some(&parent));
        if validation.status != TxStatus::Accepted {
            if let Some(s) = self.peers.get(&from) {
                let addr = s.addr;
                self.peer_man
                    .penalize(&addr, PenaltyReason::InvalidTransaction, now_ms / 1000);
            }
            return;
        }
        let Some(new_ctx) = validation.new_context else {
            return;
        };
        self.dependent.insert(tx, Some(parent), new_ctx);

        // Peers that declared interest learn the new best context.
        let best = self.dependent.best();
        let interested: Vec<PeerId> = self
            .peers
            .values()
            .filter(|s| s.is_logged_in() && s.dependent_ctx.is_some() && s.id != from)
            .map(|s| s.id)
            .collect();
        for peer in interested {
            self.send(peer, WireMessage::DependentContextState { best });
        }
    }

    // -- BBS ---------------------------------------------------------------

    fn on_bbs_msg(&mut self, from: PeerId, msg: BbsMessage, now_ms: u64) {
        if !self.bbs.is_enabled() {
            return;
        }
        if msg.payload.len() > MAX_BBS_MSG_SIZE {
            self.drop_insane(from, now_ms);
            return;
        }
        match self.bbs.publish(msg, Timestamp::new(now_ms / 1000)) {
            PublishOutcome::Stored {
                id, subscribers, ..
            } => {
                self.wanted_bbs.remove(&id);
                for peer in subscribers {
                    if peer != from {
                        self.send(peer, WireMessage::BbsHaveMsg { id });
                    }
                }
            }
            PublishOutcome::Duplicate
            | PublishOutcome::Expired
            | PublishOutcome::LimitsExceeded => {}
            PublishOutcome::TooLarge => self.drop_insane(from, now_ms),
        }
    }

    // -- Backpressure ------------------------------------------------------

    fn on_drained(&mut self, peer: PeerId, bytes: usize, now_ms: u64) {
        let Some(session) = self.peers.get_mut(&peer) else {
            return;
        };
        let remaining = session.drained(bytes);
        if session.flags.contains(PeerFlags::CHOCKING) && remaining < self.cfg.bandwidth.chocking {
            session.flags.remove(PeerFlags::CHOCKING);
            tracing::debug!(%peer, "outbound queue drained, chocking cleared");
            self.try_assign_tasks(now_ms);
        }
    }

    // -- Timers ------------------------------------------------------------

    fn on_timer(&mut self, kind: TimerKind, now_ms: u64) {
        match kind {
            TimerKind::Tick => self.on_tick(now_ms),
            TimerKind::PeersUpdate => self.on_peers_update(now_ms),
            TimerKind::PeersFlush => {} // persistence is driven by the runtime
            TimerKind::PeersResend => self.on_peers_resend(now_ms),
            TimerKind::BbsCleanup => {
                self.bbs.cleanup(Timestamp::new(now_ms / 1000));
            }
            TimerKind::MinerRestart => {
                if self.mempool_dirty && self.miner.may_soft_restart(now_ms) {
                    self.rebuild_template(now_ms);
                }
            }
        }
    }

    fn on_tick(&mut self, now_ms: u64) {
        // Collect verification completions first: a task's completion is
        // observed before any later work for the same peer.
        if let Some(pool) = self.workers.as_ref() {
            let done = pool.try_drain();
            for d in done {
                self.on_worker_done(d, now_ms);
            }
        }

        // Wanted items that never arrived simply expire.
        let _ = self.wanted_tx.expire(now_ms);
        let _ = self.wanted_bbs.expire(now_ms);

        // Stem timers (including aggregation deadlines).
        for (fp, entry) in self.stem.expire(now_ms) {
            let reason = if entry.aggregating && entry.timeout_at_ms > now_ms {
                FluffReason::Aggregated
            } else {
                FluffReason::Timeout
            };
            self.stem_to_fluff(fp, entry, reason, now_ms);
        }

        // Request timeouts: the first task per peer drives the timer.
        let peer_ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for peer in peer_ids {
            self.check_request_timeout(peer, now_ms);
            self.check_pong(peer, now_ms);
        }
    }

    fn check_request_timeout(&mut self, peer: PeerId, now_ms: u64) {
        let Some(session) = self.peers.get(&peer) else {
            return;
        };
        let Some(&key) = session.tasks.front() else {
            return;
        };
        let Some(task) = self.tasks.get(&key) else {
            return;
        };
        let timeout = if key.1 {
            self.cfg.timeouts.get_block_ms
        } else {
            self.cfg.timeouts.get_state_ms
        };
        let Some(assigned_at) = task.assigned_at_ms else {
            return;
        };
        if assigned_at + timeout > now_ms {
            return;
        }

        tracing::debug!(%peer, key = ?key.0, is_body = key.1, "request timed out");
        self.metrics.task_timeouts.inc();
        let addr = session.addr;
        self.peer_man
            .penalize(&addr, PenaltyReason::Timeout, now_ms / 1000);

        let disconnect = {
            let session = self.peers.get_mut(&peer).expect("session exists");
            session.tasks.pop_front();
            session.note_timeout(key);
            session.consecutive_timeouts >= DISCONNECT_AFTER_TIMEOUTS
        };
        self.tasks.release(&key, Placement::Front);

        if disconnect {
            self.disconnect(peer, ByeReason::Timeout, now_ms);
        }
        self.try_assign_tasks(now_ms);
    }

    fn check_pong(&mut self, peer: PeerId, now_ms: u64) {
        let Some(session) = self.peers.get(&peer) else {
            return;
        };
        if let Some(deadline) = session.pong_deadline_ms {
            if now_ms >= deadline {
                tracing::debug!(%peer, "pong watchdog fired");
                self.disconnect(peer, ByeReason::Timeout, now_ms);
            }
        }
    }

    fn on_peers_update(&mut self, now_ms: u64) {
        let now_s = now_ms / 1000;
        self.peer_man.check_bans(now_s);

        // Keep the outbound connection count up.
        let live = self.peers.len();
        if live < self.cfg.target_connections {
            let connected: Vec<SocketAddr> = self.peers.values().map(|s| s.addr).collect();
            let want = self.cfg.target_connections - live;
            let dials: Vec<SocketAddr> = self
                .peer_man
                .connect_candidates(want * 2, now_s)
                .into_iter()
                .filter(|addr| !connected.contains(addr))
                .take(want)
                .collect();
            for addr in dials {
                self.actions.push(NodeAction::Dial { addr });
            }
        }

        // Ping peers that have been quiet for a while.
        let pong_ms = self.cfg.timeouts.pong_ms;
        let to_ping: Vec<PeerId> = self
            .peers
            .values()
            .filter(|s| s.is_logged_in())
            .filter(|s| s.pong_deadline_ms.is_none())
            .filter(|s| now_ms.saturating_sub(s.last_activity_ms) > pong_ms / 2)
            .map(|s| s.id)
            .collect();
        for peer in to_ping {
            if let Some(s) = self.peers.get_mut(&peer) {
                s.pong_deadline_ms = Some(now_ms + pong_ms);
            }
            self.send(peer, WireMessage::Ping);
        }

        // Congestion recovery: keep re-evaluating until something sticks.
        if self.tasks.unassigned_len() > 0 {
            self.try_assign_tasks(now_ms);
        }
    }

    fn on_peers_resend(&mut self, now_ms: u64) {
        let now_s = now_ms / 1000;
        let known: Vec<PeerAddress> = self
            .peer_man
            .random_known(PEERS_RESEND_BATCH, now_s, &mut self.rng)
            .into_iter()
            .filter_map(|rec| rec.id.map(|id| PeerAddress { id, addr: rec.addr }))
            .collect();
        if known.is_empty() {
            return;
        }
        let targets: Vec<PeerId> = self
            .peers
            .values()
            .filter(|s| s.is_logged_in())
            .filter(|s| s.login_flags.contains(LoginFlags::SEND_PEERS))
            .map(|s| s.id)
            .collect();
        for peer in targets {
            for info in &known {
                self.send(peer, WireMessage::PeerInfo(*info));
            }
        }
    }

    // -- Task assignment ---------------------------------------------------

    /// Bind unassigned tasks to eligible peers per the assignment policy.
    fn try_assign_tasks(&mut self, now_ms: u64) {
        let now_s = now_ms / 1000;
        let mut assigned_any = false;

        for key in self.tasks.unassigned_keys() {
            let is_body = key.1;
            if !self.tasks.under_global_cap(
                is_body,
                self.cfg.max_concurrent_hdr_packs,
                self.cfg.max_concurrent_body_requests,
            ) {
                continue;
            }
            let per_peer_cap = if is_body {
                self.cfg.per_peer_body_requests
            } else {
                self.cfg.per_peer_hdr_packs
            };

            // Eligibility, then preference: adjusted rating desc, queue
            // depth asc, latency asc.
            let best = self
                .peers
                .values()
                .filter(|s| s.accepts_tasks())
                .filter(|s| s.can_serve(&key))
                .filter(|s| s.queued_count(is_body) < per_peer_cap)
                .max_by(|a, b| {
                    let ra = self
                        .peer_man
                        .get(&a.addr)
                        .map(|p| p.adjusted_rating(now_s))
                        .unwrap_or(RATING_INITIAL);
                    let rb = self
                        .peer_man
                        .get(&b.addr)
                        .map(|p| p.adjusted_rating(now_s))
                        .unwrap_or(RATING_INITIAL);
                    ra.cmp(&rb)
                        .then(b.tasks.len().cmp(&a.tasks.len()))
                        .then(b.latency_ms().cmp(&a.latency_ms()))
                })
                .map(|s| s.id);

            let Some(peer) = best else {
                continue;
            };
            if !self.tasks.assign(&key, peer, now_ms) {
                continue;
            }
            let count = self.tasks.get(&key).map(|t| t.count).unwrap_or(1);
            if let Some(session) = self.peers.get_mut(&peer) {
                session.tasks.push_back(key);
            }
            assigned_any = true;

            let msg = if is_body {
                if count <= 1 {
                    WireMessage::GetBody { id: key.0 }
                } else {
                    WireMessage::GetBodyPack {
                        top: key.0,
                        count,
                        max_size: self.cfg.bandwidth.max_body_pack_size as u32,
                    }
                }
            } else {
                WireMessage::GetHdrPack {
                    top: key.0,
                    count,
                }
            };
            self.send(peer, msg);
        }

        if assigned_any {
            self.sync.leave_congested();
        } else if self.tasks.unassigned_len() > 0
            && !matches!(self.sync.state(), SyncState::Idle | SyncState::Tip)
        {
            self.sync.enter_congested();
        }
    }

    // -- Bookkeeping -------------------------------------------------------

    fn refresh_gauges(&mut self) {
        self.metrics.peer_count.set(self.peers.len() as i64);
        self.metrics.mempool_count.set(self.fluff.len() as i64);
        self.metrics
            .mempool_bytes
            .set(self.fluff.total_weight() as i64);
        self.metrics.stem_count.set(self.stem.len() as i64);
        let totals = self.bbs.totals();
        self.metrics.bbs_count.set(totals.count as i64);
        self.metrics.bbs_bytes.set(totals.bytes as i64);
        let progress = self.sync.progress();
        self.metrics.sync_done.set(progress.done as i64);
        self.metrics.sync_total.set(progress.total as i64);
    }

    fn report_progress(&mut self) {
        let progress = self.sync.progress();
        if progress != self.last_progress {
            self.last_progress = progress;
            self.callbacks.sync_progress(progress);
        }
    }
}
